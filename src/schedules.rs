//! Built-in schedule variants.
//!
//! Each variant fixes the base frequency, run length, pool size, and the
//! service table (periods, CPU placement, stage parameters). Variants are
//! compiled in; the CLI picks one by name.

use color_eyre::eyre::{eyre, Result};

use crate::camera::Camera;
use crate::pipeline::{PipelineConfig, QueueId};
use crate::rt::ThreadPolicy;
use crate::sequencer::{Runtime, Schedule, ScheduleSpec};
use crate::service::ServiceSpec;
use crate::stages::{
    BestPolicy, BlurStage, CaptureStage, DifferenceStage, SelectStage, WriteStage,
};
use crate::stages::write::DEFAULT_OUTPUT_DIRECTORY;

pub const VARIANT_NAMES: &[&str] = &["1hz", "10hz", "1hz-blur"];

/// Tick threshold tuned for the 1 Hz capture cadence.
const ONE_HZ_TICK_THRESHOLD: f64 = 0.38;
/// Tick threshold tuned for the 10 Hz capture cadence.
const TEN_HZ_TICK_THRESHOLD: f64 = 0.45;

fn service(id: u32, name: &str, period: u32, cpu: usize) -> ServiceSpec {
    ServiceSpec {
        id,
        name: name.into(),
        period,
        cpu,
    }
}

/// ~1 Hz of selected output: 3 Hz base tick, 570 iterations, 20-frame pool.
pub fn one_hz(camera: Box<dyn Camera>, policy: ThreadPolicy) -> Result<Runtime> {
    let (width, height) = camera.dimensions();
    let pipeline = PipelineConfig {
        frame_count: 20,
        width,
        height,
        blur: false,
    };
    let schedule = Schedule::new(ScheduleSpec {
        frequency: 3.0,
        max_iterations: 570,
        sequencer_cpu: 0,
        policy,
    })
    .with_service(
        service(1, "Capture Frame", 1, 3),
        Box::new(CaptureStage::new(camera)),
    )
    .with_service(
        service(2, "Difference Frame", 1, 3),
        Box::new(DifferenceStage::new()),
    )
    .with_service(
        service(3, "Select Frame", 1, 3),
        Box::new(SelectStage::new(
            ONE_HZ_TICK_THRESHOLD,
            BestPolicy::IntervalMinimum,
        )),
    )
    .with_service(
        service(4, "Write Frame", 3, 3),
        Box::new(WriteStage::new(QueueId::Selected, DEFAULT_OUTPUT_DIRECTORY)),
    );
    Runtime::new(schedule, pipeline)
}

/// ~10 Hz of selected output: 30 Hz base tick, 5600 iterations, 100-frame
/// pool, capture on its own core.
pub fn ten_hz(camera: Box<dyn Camera>, policy: ThreadPolicy) -> Result<Runtime> {
    let (width, height) = camera.dimensions();
    let pipeline = PipelineConfig {
        frame_count: 100,
        width,
        height,
        blur: false,
    };
    let schedule = Schedule::new(ScheduleSpec {
        frequency: 30.0,
        max_iterations: 5600,
        sequencer_cpu: 0,
        policy,
    })
    .with_service(
        service(1, "Capture Frame", 1, 2),
        Box::new(CaptureStage::new(camera)),
    )
    .with_service(
        service(2, "Difference Frame", 1, 3),
        Box::new(DifferenceStage::new()),
    )
    .with_service(
        service(3, "Select Frame", 1, 3),
        Box::new(SelectStage::new(
            TEN_HZ_TICK_THRESHOLD,
            BestPolicy::IntervalMinimum,
        )),
    )
    .with_service(
        service(4, "Write Frame", 3, 3),
        Box::new(WriteStage::new(QueueId::Selected, DEFAULT_OUTPUT_DIRECTORY)),
    );
    Runtime::new(schedule, pipeline)
}

/// The 1 Hz schedule with a box blur between select and write.
pub fn one_hz_blur(camera: Box<dyn Camera>, policy: ThreadPolicy) -> Result<Runtime> {
    let (width, height) = camera.dimensions();
    let pipeline = PipelineConfig {
        frame_count: 20,
        width,
        height,
        blur: true,
    };
    let schedule = Schedule::new(ScheduleSpec {
        frequency: 3.0,
        max_iterations: 570,
        sequencer_cpu: 0,
        policy,
    })
    .with_service(
        service(1, "Capture Frame", 1, 1),
        Box::new(CaptureStage::new(camera)),
    )
    .with_service(
        service(2, "Difference Frame", 1, 2),
        Box::new(DifferenceStage::new()),
    )
    .with_service(
        service(3, "Select Frame", 1, 2),
        Box::new(SelectStage::new(
            ONE_HZ_TICK_THRESHOLD,
            BestPolicy::IntervalMinimum,
        )),
    )
    .with_service(
        service(5, "Blur Frame", 3, 3),
        Box::new(BlurStage::new(crate::stages::blur::DEFAULT_KERNEL)),
    )
    .with_service(
        service(4, "Write Frame", 3, 3),
        Box::new(WriteStage::new(QueueId::Blurred, DEFAULT_OUTPUT_DIRECTORY)),
    );
    Runtime::new(schedule, pipeline)
}

/// Look a variant up by its CLI name.
pub fn by_name(name: &str, camera: Box<dyn Camera>, policy: ThreadPolicy) -> Result<Runtime> {
    match name {
        "1hz" => one_hz(camera, policy),
        "10hz" => ten_hz(camera, policy),
        "1hz-blur" => one_hz_blur(camera, policy),
        other => Err(eyre!(
            "unknown schedule variant '{other}'; available: {}",
            VARIANT_NAMES.join(", ")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticCamera;

    fn camera() -> Box<dyn Camera> {
        Box::new(SyntheticCamera::uniform(8, 8, 50))
    }

    #[test]
    fn one_hz_matches_the_published_table() {
        let runtime = one_hz(camera(), ThreadPolicy::Normal).unwrap();
        let pipeline = runtime.pipeline();
        assert_eq!(pipeline.frame_count(), 20);
        assert!(!pipeline.config().blur);
    }

    #[test]
    fn ten_hz_uses_the_larger_pool() {
        let runtime = ten_hz(camera(), ThreadPolicy::Normal).unwrap();
        assert_eq!(runtime.pipeline().frame_count(), 100);
    }

    #[test]
    fn blur_variant_opens_the_blur_link() {
        let runtime = one_hz_blur(camera(), ThreadPolicy::Normal).unwrap();
        assert!(runtime.pipeline().config().blur);
    }

    #[test]
    fn unknown_variant_is_rejected() {
        assert!(by_name("2hz", camera(), ThreadPolicy::Normal).is_err());
    }

    #[test]
    fn schedule_specs_round_trip_through_serde() {
        let spec = ScheduleSpec {
            frequency: 3.0,
            max_iterations: 570,
            sequencer_cpu: 0,
            policy: ThreadPolicy::Normal,
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: ScheduleSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.frequency, spec.frequency);
        assert_eq!(back.max_iterations, spec.max_iterations);

        let service = service(1, "Capture Frame", 1, 3);
        let json = serde_json::to_string(&service).unwrap();
        let back: ServiceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "Capture Frame");
        assert_eq!(back.period, 1);
    }
}
