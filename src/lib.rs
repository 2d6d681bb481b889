//! Rate-monotonic service sequencer for a real-time frame pipeline
//!
//! A fixed schedule of periodic services runs on pinned SCHED_FIFO threads,
//! released by a sequencer ticking at the base frequency. Frames flow
//! zero-copy around a preallocated pool: stages exchange ownership tokens
//! over bounded queues, never pixels.

#![warn(rust_2018_idioms)]

pub mod camera;
pub mod clock;
pub mod logger;
pub mod pipeline;
pub mod rt;
pub mod schedules;
pub mod sequencer;
pub mod service;
pub mod stages;
pub mod sync;

pub use camera::{Camera, SyntheticCamera, V4lCamera};
pub use pipeline::{Frame, FramePipeline, FrameToken, PipelineConfig, QueueId};
pub use rt::ThreadPolicy;
pub use sequencer::{RunReport, Runtime, Schedule, ScheduleSpec};
pub use service::{Service, ServiceSpec, Stage};
