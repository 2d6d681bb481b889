//! Blur stage: in-place box filter between select and write.

use std::time::Duration;

use color_eyre::eyre::Result;
use tracing::warn;

use crate::pipeline::{FramePipeline, QueueId};
use crate::service::{Service, Stage};

pub const DEFAULT_KERNEL: usize = 20;

pub struct BlurStage {
    kernel: usize,
    scratch: Vec<u8>,
    prefix: Vec<u32>,
    input_timeout: Duration,
}

impl BlurStage {
    pub fn new(kernel: usize) -> Self {
        Self {
            kernel: kernel.max(1),
            scratch: Vec::new(),
            prefix: Vec::new(),
            input_timeout: super::DEFAULT_INPUT_TIMEOUT,
        }
    }

    pub fn with_input_timeout(mut self, input_timeout: Duration) -> Self {
        self.input_timeout = input_timeout;
        self
    }

    /// Mean filter along one axis for one channel, windows clamped at the
    /// edges. Prefix sums make each lane O(length).
    fn blur_lane(
        prefix: &mut Vec<u32>,
        read: impl Fn(usize) -> u8,
        mut store: impl FnMut(usize, u8),
        length: usize,
        kernel: usize,
    ) {
        prefix.clear();
        prefix.push(0);
        for index in 0..length {
            let last = *prefix.last().unwrap_or(&0);
            prefix.push(last + read(index) as u32);
        }
        let half_low = (kernel - 1) / 2;
        let half_high = kernel / 2;
        for index in 0..length {
            let low = index.saturating_sub(half_low);
            let high = (index + half_high + 1).min(length);
            let sum = prefix[high] - prefix[low];
            store(index, (sum / (high - low) as u32) as u8);
        }
    }
}

impl Stage for BlurStage {
    fn setup(&mut self, pipeline: &FramePipeline) -> Result<()> {
        let (width, height) = pipeline.dimensions();
        self.scratch = vec![0; width as usize * height as usize * 3];
        self.prefix = Vec::with_capacity(width.max(height) as usize + 1);
        Ok(())
    }

    fn work(&mut self, pipeline: &FramePipeline, service: &Service, _request: u64) -> Result<()> {
        let Some(token) = pipeline.recv_timeout(QueueId::Selected, self.input_timeout)? else {
            warn!(
                service = %service.spec().name,
                "selected queue idle past timeout"
            );
            return Ok(());
        };

        {
            let mut frame = pipeline.frame(token);
            let width = frame.width() as usize;
            let height = frame.height() as usize;
            let kernel = self.kernel;

            // Horizontal pass: pixels -> scratch.
            for row in 0..height {
                for channel in 0..3 {
                    let base = row * width * 3 + channel;
                    let pixels = &frame.pixels;
                    let scratch = &mut self.scratch;
                    Self::blur_lane(
                        &mut self.prefix,
                        |x| pixels[base + x * 3],
                        |x, value| scratch[base + x * 3] = value,
                        width,
                        kernel,
                    );
                }
            }
            // Vertical pass: scratch -> pixels.
            for column in 0..width {
                for channel in 0..3 {
                    let base = column * 3 + channel;
                    let scratch = &self.scratch;
                    let pixels = &mut frame.pixels;
                    Self::blur_lane(
                        &mut self.prefix,
                        |y| scratch[base + y * width * 3],
                        |y, value| pixels[base + y * width * 3] = value,
                        height,
                        kernel,
                    );
                }
            }
        }
        pipeline.send(QueueId::Blurred, token)
    }

    fn teardown(&mut self, _pipeline: &FramePipeline) -> Result<()> {
        Ok(())
    }
}
