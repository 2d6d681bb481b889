//! SCHED_FIFO bring-up and CPU pinning.
//!
//! Rate-monotonic dispatch only holds if every service thread really runs
//! under preemptive fixed-priority scheduling on its assigned core, so under
//! `ThreadPolicy::Realtime` every failure here is fatal. `ThreadPolicy::Normal`
//! leaves the default scheduler in place for unprivileged runs and tests.

use std::io;

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Whether threads are promoted to real-time scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadPolicy {
    /// SCHED_FIFO with explicit priorities and CPU affinity. Requires
    /// CAP_SYS_NICE or root; any failure refuses the run.
    Realtime,
    /// Leave the kernel's default scheduling in place. Release order is still
    /// correct, deadlines are best-effort.
    Normal,
}

/// Highest priority the kernel accepts for SCHED_FIFO.
pub fn max_fifo_priority() -> i32 {
    // Only fails for an invalid policy constant.
    unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) }
}

/// CPU the calling thread is currently executing on.
pub fn current_cpu() -> i32 {
    unsafe { libc::sched_getcpu() }
}

/// Restrict the calling thread to a single CPU.
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu, &mut cpu_set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Switch the calling thread to SCHED_FIFO at the given priority.
pub fn set_current_thread_fifo(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // pthread_setschedparam reports the error code in its return value.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Whether the calling thread is running SCHED_FIFO at max priority.
pub fn current_thread_is_max_fifo() -> bool {
    let mut param = libc::sched_param { sched_priority: 0 };
    let policy = unsafe {
        if libc::sched_getparam(0, &mut param) != 0 {
            return false;
        }
        libc::sched_getscheduler(0)
    };
    policy == libc::SCHED_FIFO && param.sched_priority == max_fifo_priority()
}

/// Apply `policy` to the calling thread: pin it to `cpu` and set SCHED_FIFO
/// at `priority`. A no-op under `ThreadPolicy::Normal`.
pub fn apply(policy: ThreadPolicy, cpu: usize, priority: i32) -> Result<()> {
    match policy {
        ThreadPolicy::Normal => Ok(()),
        ThreadPolicy::Realtime => {
            pin_current_thread(cpu)
                .wrap_err_with(|| format!("sched_setaffinity() to CPU {cpu}"))?;
            set_current_thread_fifo(priority)
                .wrap_err_with(|| format!("pthread_setschedparam() to priority {priority}"))?;
            Ok(())
        }
    }
}

/// Promote the calling thread to the top of the SCHED_FIFO range on `cpu`
/// and verify the promotion took effect. The sequencer refuses to run
/// without this.
pub fn promote_to_max_fifo(policy: ThreadPolicy, cpu: usize) -> Result<()> {
    if policy == ThreadPolicy::Normal {
        return Ok(());
    }
    apply(policy, cpu, max_fifo_priority())?;
    if !current_thread_is_max_fifo() {
        return Err(eyre!(
            "sequencer thread must not be preemptible: SCHED_FIFO at priority {} was not granted",
            max_fifo_priority()
        ));
    }
    Ok(())
}
