//! Run log formatting.
//!
//! Every line from the service runtime carries the caller's CPU, its
//! rate-monotonic priority index, and seconds elapsed since the run epoch.
//! Lines are rendered into a reusable per-thread buffer and handed to
//! `tracing` pre-formatted, so the hot path allocates nothing once the
//! buffer has grown to its steady-state size.

use std::cell::RefCell;
use std::fmt::{self, Write as _};

use once_cell::sync::OnceCell;
use tracing::info;

use crate::clock::{self, TimeStamp};
use crate::rt;

static EPOCH: OnceCell<TimeStamp> = OnceCell::new();

thread_local! {
    static LINE_BUFFER: RefCell<String> = RefCell::new(String::with_capacity(256));
}

/// Record the run epoch and emit the run header.
pub fn start(prefix: &str) {
    let _ = EPOCH.set(clock::monotonic_raw());
    info!("{prefix} run log started");
}

/// Time elapsed since `start` (or since first use, if `start` was skipped).
pub fn elapsed() -> TimeStamp {
    let epoch = EPOCH.get_or_init(clock::monotonic_raw);
    clock::monotonic_raw().since(*epoch)
}

pub(crate) fn render_prefix(buffer: &mut String, cpu: i32, priority: i32, elapsed: TimeStamp) {
    // A failed write! into a String is impossible.
    let _ = write!(
        buffer,
        "CPU: {}, Priority: {}, Elapsed: {}.{:09}, ",
        cpu, priority, elapsed.sec, elapsed.nsec
    );
}

/// Emit one prefixed log line. `priority` is the caller's descending
/// priority index; the sequencer and main thread log as 0.
pub fn write(priority: i32, message: fmt::Arguments<'_>) {
    LINE_BUFFER.with(|cell| {
        let mut buffer = cell.borrow_mut();
        buffer.clear();
        render_prefix(&mut buffer, rt::current_cpu(), priority, elapsed());
        let _ = buffer.write_fmt(message);
        info!("{}", buffer.as_str());
    });
}

/// Emit the per-frame capture stamp line.
pub fn frame_stamp(frame_count: u64, capture_start: TimeStamp) {
    info!(
        "[COURSE #:4][Final Project][Frame Count: {}] [Image Capture Start Time: {}.{:09}]",
        frame_count, capture_start.sec, capture_start.nsec
    );
}
