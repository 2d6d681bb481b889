//! The pipeline stages: capture → difference → select → [blur] → write.
//!
//! Each stage consumes tokens from one queue and produces to the next; the
//! only state a stage needs lives on the stage value itself. Input receives
//! are bounded so a starved stage logs and yields its release instead of
//! wedging shutdown.

pub mod blur;
pub mod capture;
pub mod difference;
pub mod select;
pub mod write;

use std::time::Duration;

/// How long a stage waits on its input queue before treating the release
/// as spurious and returning.
pub(crate) const DEFAULT_INPUT_TIMEOUT: Duration = Duration::from_secs(2);

pub use blur::BlurStage;
pub use capture::CaptureStage;
pub use difference::DifferenceStage;
pub use select::{BestPolicy, SelectStage};
pub use write::WriteStage;
