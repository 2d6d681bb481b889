//! Select stage: tick detection and best-frame tracking.
//!
//! The scene is assumed to be long stable stretches punctuated by motion
//! spikes (a filmed clock face). An upward threshold crossing marks a tick;
//! at each tick the stage emits the stillest frame of the stable interval
//! that just ended and starts tracking the new interval.

use std::time::Duration;

use color_eyre::eyre::Result;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::logger;
use crate::pipeline::{FramePipeline, FrameToken, QueueId};
use crate::service::{Service, Stage};

/// How the held best frame is replaced between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BestPolicy {
    /// Track the minimum-difference frame of the interval.
    IntervalMinimum,
    /// Keep the first frame whose difference falls back below the
    /// threshold after motion.
    FirstBelowThreshold,
}

pub struct SelectStage {
    threshold: f64,
    policy: BestPolicy,
    previous_percentage: f64,
    current_best: Option<FrameToken>,
    input_timeout: Duration,
}

impl SelectStage {
    pub fn new(threshold: f64, policy: BestPolicy) -> Self {
        Self {
            threshold,
            policy,
            previous_percentage: 0.0,
            current_best: None,
            input_timeout: super::DEFAULT_INPUT_TIMEOUT,
        }
    }

    pub fn with_input_timeout(mut self, input_timeout: Duration) -> Self {
        self.input_timeout = input_timeout;
        self
    }
}

impl Stage for SelectStage {
    fn setup(&mut self, _pipeline: &FramePipeline) -> Result<()> {
        self.previous_percentage = 0.0;
        self.current_best = None;
        Ok(())
    }

    fn work(&mut self, pipeline: &FramePipeline, service: &Service, _request: u64) -> Result<()> {
        let Some(token) = pipeline.recv_timeout(QueueId::Differenced, self.input_timeout)? else {
            warn!(
                service = %service.spec().name,
                "differenced queue idle past timeout"
            );
            return Ok(());
        };

        let percentage = pipeline.frame(token).difference_percentage;

        // The first frame seeds the interval; it is held, not forwarded.
        let Some(best) = self.current_best else {
            self.current_best = Some(token);
            self.previous_percentage = percentage;
            return Ok(());
        };

        let rising = self.previous_percentage < self.threshold && percentage >= self.threshold;
        let falling = self.previous_percentage >= self.threshold && percentage < self.threshold;

        if rising {
            // Tick: the stillest frame of the interval that just ended goes
            // downstream; this frame opens the next interval.
            logger::write(
                service.priority_descending(),
                format_args!(
                    "tick at {percentage:.3}% (previous {:.3}%)",
                    self.previous_percentage
                ),
            );
            counter!("ticks_detected").increment(1);
            pipeline.send(QueueId::Selected, best)?;
            self.current_best = Some(token);
        } else {
            let adopt = match self.policy {
                BestPolicy::IntervalMinimum => {
                    percentage < pipeline.frame(best).difference_percentage
                }
                BestPolicy::FirstBelowThreshold => falling,
            };
            if adopt {
                pipeline.send(QueueId::Available, best)?;
                self.current_best = Some(token);
            } else {
                pipeline.send(QueueId::Available, token)?;
            }
        }

        self.previous_percentage = percentage;
        Ok(())
    }

    fn teardown(&mut self, pipeline: &FramePipeline) -> Result<()> {
        // Return the held frame so the pool stays whole across runs.
        if let Some(best) = self.current_best.take() {
            pipeline.send(QueueId::Available, best)?;
        }
        Ok(())
    }
}
