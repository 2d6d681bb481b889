//! Schedule runner: pick a built-in variant and drive it to completion.

use color_eyre::eyre::{eyre, Result};
use tracing::info;

use realtimely::camera::{self, Camera, SyntheticCamera, V4lCamera};
use realtimely::logger;
use realtimely::rt::ThreadPolicy;
use realtimely::schedules;

const LOG_PREFIX: &str = "[REAL TIMELY]";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

struct Options {
    variant: String,
    camera: String,
    policy: ThreadPolicy,
}

fn usage() -> String {
    format!(
        "usage: realtimely [VARIANT] [--camera auto|synthetic|<device-path>] [--no-rt]\n\
         variants: {}",
        schedules::VARIANT_NAMES.join(", ")
    )
}

fn parse_options() -> Result<Options> {
    let mut options = Options {
        variant: "1hz".into(),
        camera: "auto".into(),
        policy: ThreadPolicy::Realtime,
    };
    let mut positional_seen = false;

    let mut arguments = std::env::args().skip(1);
    while let Some(argument) = arguments.next() {
        match argument.as_str() {
            "--no-rt" => options.policy = ThreadPolicy::Normal,
            "--camera" => {
                options.camera = arguments
                    .next()
                    .ok_or_else(|| eyre!("--camera needs a value\n{}", usage()))?;
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            flag if flag.starts_with('-') => {
                return Err(eyre!("unknown flag '{flag}'\n{}", usage()));
            }
            variant if !positional_seen => {
                options.variant = variant.to_string();
                positional_seen = true;
            }
            extra => return Err(eyre!("unexpected argument '{extra}'\n{}", usage())),
        }
    }
    Ok(options)
}

fn open_camera(selector: &str) -> Result<Box<dyn Camera>> {
    match selector {
        "synthetic" => Ok(Box::new(SyntheticCamera::clock_face(
            DEFAULT_WIDTH,
            DEFAULT_HEIGHT,
        ))),
        "auto" => {
            let path = camera::detect_device()?;
            Ok(Box::new(V4lCamera::open(
                &path,
                DEFAULT_WIDTH,
                DEFAULT_HEIGHT,
            )?))
        }
        path => Ok(Box::new(V4lCamera::open(
            path,
            DEFAULT_WIDTH,
            DEFAULT_HEIGHT,
        )?)),
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "realtimely=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let options = parse_options()?;
    info!("Schedule variant: {}", options.variant);

    let camera = open_camera(&options.camera)?;
    logger::start(LOG_PREFIX);

    let runtime = schedules::by_name(&options.variant, camera, options.policy)?;
    let report = runtime.run()?;

    info!(
        "Run complete: {} iterations in {:.3} s",
        report.iterations, report.elapsed_seconds
    );
    for service in &report.services {
        info!(
            "Service: {}, Service Name: {}, Priority: {}, Releases: {}, Requests: {}",
            service.id, service.name, service.priority_descending, service.released,
            service.requests
        );
    }
    Ok(())
}
