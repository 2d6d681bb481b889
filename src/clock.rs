//! Clock reads and interval timing for the sequencer.
//!
//! All elapsed-time measurement uses `CLOCK_MONOTONIC_RAW` so NTP slewing
//! cannot distort per-request timings. The interval timer sleeps to absolute
//! deadlines on `CLOCK_MONOTONIC` (the only monotonic clock
//! `clock_nanosleep` accepts), so tick `k` lands at `start + k * interval`
//! regardless of how long the tick handler ran.

use std::io;

use color_eyre::eyre::{eyre, Result, WrapErr};

pub const NANOSECONDS_PER_SECOND: i64 = 1_000_000_000;

/// A clock reading or duration, in whole seconds plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeStamp {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeStamp {
    /// Fold nanosecond overflow or underflow back into the seconds field.
    pub fn normalize(mut self) -> Self {
        while self.nsec >= NANOSECONDS_PER_SECOND {
            self.sec += 1;
            self.nsec -= NANOSECONDS_PER_SECOND;
        }
        while self.nsec < 0 {
            self.sec -= 1;
            self.nsec += NANOSECONDS_PER_SECOND;
        }
        self
    }

    /// Elapsed time from `earlier` to `self`.
    pub fn since(self, earlier: TimeStamp) -> TimeStamp {
        TimeStamp {
            sec: self.sec - earlier.sec,
            nsec: self.nsec - earlier.nsec,
        }
        .normalize()
    }

    pub fn as_seconds_f64(self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NANOSECONDS_PER_SECOND as f64
    }

    pub fn from_seconds_f64(seconds: f64) -> Self {
        let sec = seconds.floor();
        TimeStamp {
            sec: sec as i64,
            nsec: ((seconds - sec) * NANOSECONDS_PER_SECOND as f64).round() as i64,
        }
        .normalize()
    }

    pub fn as_nanoseconds(self) -> i64 {
        self.sec * NANOSECONDS_PER_SECOND + self.nsec
    }
}

fn read_clock(clock_id: libc::clockid_t) -> TimeStamp {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime only fails for an invalid clock id, which would be a
    // programming error here.
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    debug_assert_eq!(rc, 0, "clock_gettime: {}", io::Error::last_os_error());
    TimeStamp {
        sec: ts.tv_sec as i64,
        nsec: ts.tv_nsec as i64,
    }
}

/// Current monotonic-raw clock reading.
pub fn monotonic_raw() -> TimeStamp {
    read_clock(libc::CLOCK_MONOTONIC_RAW)
}

/// Current wall-clock reading.
pub fn realtime() -> TimeStamp {
    read_clock(libc::CLOCK_REALTIME)
}

/// Absolute-deadline periodic timer.
///
/// Each `wait_tick` advances the deadline by exactly one interval and sleeps
/// until it, so handler runtime never accumulates as drift.
pub struct IntervalTimer {
    interval_ns: i64,
    next_deadline: TimeStamp,
}

impl IntervalTimer {
    /// Build a timer firing at `frequency` Hz. The interval is computed in
    /// nanoseconds from the full-precision frequency.
    pub fn from_frequency(frequency: f64) -> Result<Self> {
        if !(frequency > 0.0) || !frequency.is_finite() {
            return Err(eyre!("timer frequency must be positive, got {frequency}"));
        }
        let interval_ns = (NANOSECONDS_PER_SECOND as f64 / frequency).round() as i64;
        if interval_ns == 0 {
            return Err(eyre!("timer frequency {frequency} Hz is above 1 GHz"));
        }
        Ok(Self {
            interval_ns,
            next_deadline: read_clock(libc::CLOCK_MONOTONIC),
        })
    }

    pub fn interval_ns(&self) -> i64 {
        self.interval_ns
    }

    /// Sleep until the next tick deadline.
    pub fn wait_tick(&mut self) -> Result<()> {
        self.next_deadline = TimeStamp {
            sec: self.next_deadline.sec,
            nsec: self.next_deadline.nsec + self.interval_ns,
        }
        .normalize();

        let deadline = libc::timespec {
            tv_sec: self.next_deadline.sec as libc::time_t,
            tv_nsec: self.next_deadline.nsec as libc::c_long,
        };
        loop {
            let rc = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &deadline,
                    std::ptr::null_mut(),
                )
            };
            match rc {
                0 => return Ok(()),
                libc::EINTR => continue,
                errno => {
                    return Err(io::Error::from_raw_os_error(errno))
                        .wrap_err("clock_nanosleep(TIMER_ABSTIME)")
                }
            }
        }
    }
}
