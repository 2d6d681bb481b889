//! Capture stage: fills free frame slots from the camera.

use std::thread;
use std::time::{Duration, Instant};

use color_eyre::eyre::{eyre, Result};
use metrics::{counter, gauge};
use tracing::{info, warn};

use crate::camera::Camera;
use crate::clock;
use crate::logger;
use crate::pipeline::{FramePipeline, QueueId};
use crate::service::{Service, Stage};

/// Pause between retries when the camera delivers nothing.
const READ_RETRY_DELAY: Duration = Duration::from_millis(25);
/// Warmup retries before the camera is declared dead.
const WARMUP_ATTEMPTS: u32 = 400;

pub struct CaptureStage {
    camera: Box<dyn Camera>,
    frame_count: u64,
    frames_since_report: u64,
    last_report: Option<Instant>,
    input_timeout: Duration,
}

impl CaptureStage {
    pub fn new(camera: Box<dyn Camera>) -> Self {
        Self {
            camera,
            frame_count: 0,
            frames_since_report: 0,
            last_report: None,
            input_timeout: super::DEFAULT_INPUT_TIMEOUT,
        }
    }

    /// Report the capture rate roughly once a second.
    fn report_rate(&mut self) {
        self.frames_since_report += 1;
        let now = Instant::now();
        let since = self.last_report.get_or_insert(now);
        let elapsed = now.duration_since(*since);
        if elapsed >= Duration::from_secs(1) {
            let fps = self.frames_since_report as f64 / elapsed.as_secs_f64();
            info!("Capture FPS: {fps:.1}");
            gauge!("capture_fps").set(fps);
            self.frames_since_report = 0;
            self.last_report = Some(now);
        }
    }

    pub fn with_input_timeout(mut self, input_timeout: Duration) -> Self {
        self.input_timeout = input_timeout;
        self
    }
}

impl Stage for CaptureStage {
    /// Warm every slot with one real frame (paging in all the buffers), then
    /// hand the whole pool to `available`.
    fn setup(&mut self, pipeline: &FramePipeline) -> Result<()> {
        for token in pipeline.tokens() {
            let mut attempts = 0;
            loop {
                let mut frame = pipeline.frame(token);
                match self.camera.read_into(&mut frame) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => warn!("camera read during warmup: {err:#}"),
                }
                drop(frame);
                attempts += 1;
                if attempts >= WARMUP_ATTEMPTS {
                    return Err(eyre!(
                        "camera produced no frame in {WARMUP_ATTEMPTS} warmup attempts"
                    ));
                }
                thread::sleep(READ_RETRY_DELAY);
            }
            pipeline.send(QueueId::Available, token)?;
        }
        Ok(())
    }

    fn work(&mut self, pipeline: &FramePipeline, service: &Service, _request: u64) -> Result<()> {
        let Some(token) = pipeline.recv_timeout(QueueId::Available, self.input_timeout)? else {
            logger::write(
                service.priority_descending(),
                format_args!("no available frame slot; skipping capture"),
            );
            return Ok(());
        };

        let capture_start = clock::realtime();
        {
            let mut frame = pipeline.frame(token);
            match self.camera.read_into(&mut frame) {
                Ok(true) => {
                    self.frame_count += 1;
                    logger::frame_stamp(self.frame_count, capture_start);
                    counter!("frames_captured").increment(1);
                    self.report_rate();
                }
                Ok(false) => {
                    // Forward the stale pixels rather than stall the ring.
                    warn!("No frame.");
                    counter!("capture_read_failures").increment(1);
                    thread::sleep(READ_RETRY_DELAY);
                }
                Err(err) => {
                    warn!("camera read failed: {err:#}");
                    counter!("capture_read_failures").increment(1);
                    thread::sleep(READ_RETRY_DELAY);
                }
            }
        }
        pipeline.send(QueueId::Captured, token)
    }

    fn teardown(&mut self, _pipeline: &FramePipeline) -> Result<()> {
        // Dropping the camera releases the device.
        logger::write(
            0,
            format_args!("capture complete after {} frames", self.frame_count),
        );
        Ok(())
    }
}
