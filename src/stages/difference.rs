//! Difference stage: grayscale conversion and inter-frame motion metric.

use std::time::Duration;

use color_eyre::eyre::Result;
use tracing::warn;

use crate::pipeline::{FramePipeline, QueueId};
use crate::service::{Service, Stage};

pub struct DifferenceStage {
    /// Grayscale plane of the previous frame, copied so downstream slot
    /// recycling can never race the comparison.
    previous_gray: Vec<u8>,
    max_diff: u64,
    primed: bool,
    input_timeout: Duration,
}

impl DifferenceStage {
    pub fn new() -> Self {
        Self {
            previous_gray: Vec::new(),
            max_diff: 0,
            primed: false,
            input_timeout: super::DEFAULT_INPUT_TIMEOUT,
        }
    }

    pub fn with_input_timeout(mut self, input_timeout: Duration) -> Self {
        self.input_timeout = input_timeout;
        self
    }
}

impl Default for DifferenceStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for DifferenceStage {
    fn setup(&mut self, pipeline: &FramePipeline) -> Result<()> {
        let (width, height) = pipeline.dimensions();
        let area = width as usize * height as usize;
        self.previous_gray = vec![0; area];
        // Worst-case absolute sum: every pixel fully changed.
        self.max_diff = area as u64 * 255;
        self.primed = false;
        Ok(())
    }

    fn work(&mut self, pipeline: &FramePipeline, service: &Service, _request: u64) -> Result<()> {
        let Some(token) = pipeline.recv_timeout(QueueId::Captured, self.input_timeout)? else {
            warn!(
                service = %service.spec().name,
                "captured queue idle past timeout"
            );
            return Ok(());
        };

        {
            let mut frame = pipeline.frame(token);
            frame.fill_gray();

            // The very first frame differences against itself: zero motion.
            if !self.primed {
                self.previous_gray.copy_from_slice(&frame.gray);
                self.primed = true;
            }

            let sum: u64 = frame
                .gray
                .iter()
                .zip(self.previous_gray.iter())
                .map(|(current, previous)| current.abs_diff(*previous) as u64)
                .sum();
            frame.difference_absolute = sum;
            frame.difference_percentage = 100.0 * sum as f64 / self.max_diff as f64;

            self.previous_gray.copy_from_slice(&frame.gray);
        }
        pipeline.send(QueueId::Differenced, token)
    }

    fn teardown(&mut self, _pipeline: &FramePipeline) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FrameToken, PipelineConfig};
    use crate::service::ServiceSpec;

    fn pipeline() -> FramePipeline {
        FramePipeline::new(PipelineConfig {
            frame_count: 3,
            width: 4,
            height: 4,
            blur: false,
        })
        .unwrap()
    }

    fn service() -> Service {
        Service::new(
            ServiceSpec {
                id: 2,
                name: "Difference Frame".into(),
                period: 1,
                cpu: 0,
            },
            1,
        )
    }

    fn push_uniform(pipeline: &FramePipeline, token: FrameToken, level: u8) {
        pipeline.frame(token).pixels.fill(level);
        pipeline.send(QueueId::Captured, token).unwrap();
    }

    #[test]
    fn first_frame_has_zero_difference() {
        let pipeline = pipeline();
        let mut stage = DifferenceStage::new().with_input_timeout(Duration::from_millis(50));
        let service = service();
        stage.setup(&pipeline).unwrap();

        let token = FrameToken::new(0);
        push_uniform(&pipeline, token, 120);
        stage.work(&pipeline, &service, 1).unwrap();

        let out = pipeline.recv(QueueId::Differenced).unwrap();
        assert_eq!(out, token);
        let frame = pipeline.frame(out);
        assert_eq!(frame.difference_absolute, 0);
        assert_eq!(frame.difference_percentage, 0.0);
    }

    #[test]
    fn uniform_level_change_yields_exact_percentage() {
        let pipeline = pipeline();
        let mut stage = DifferenceStage::new().with_input_timeout(Duration::from_millis(50));
        let service = service();
        stage.setup(&pipeline).unwrap();

        push_uniform(&pipeline, FrameToken::new(0), 100);
        stage.work(&pipeline, &service, 1).unwrap();
        push_uniform(&pipeline, FrameToken::new(1), 151);
        stage.work(&pipeline, &service, 2).unwrap();

        let _first = pipeline.recv(QueueId::Differenced).unwrap();
        let second = pipeline.recv(QueueId::Differenced).unwrap();
        let frame = pipeline.frame(second);
        // Every gray pixel moved by 51 of a possible 255: exactly 20%.
        assert_eq!(frame.difference_absolute, 16 * 51);
        assert!((frame.difference_percentage - 20.0).abs() < 1e-9);
    }

    #[test]
    fn percentage_stays_within_bounds() {
        let pipeline = pipeline();
        let mut stage = DifferenceStage::new().with_input_timeout(Duration::from_millis(50));
        let service = service();
        stage.setup(&pipeline).unwrap();

        for (index, level) in [0u8, 255, 0].into_iter().enumerate() {
            push_uniform(&pipeline, FrameToken::new(index), level);
            stage.work(&pipeline, &service, index as u64 + 1).unwrap();
            let token = pipeline.recv(QueueId::Differenced).unwrap();
            let frame = pipeline.frame(token);
            assert!(frame.difference_percentage >= 0.0);
            assert!(frame.difference_percentage <= 100.0);
        }
    }
}
