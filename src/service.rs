//! Per-service descriptor and thread runtime.
//!
//! A service is a periodic unit of work: the sequencer posts its release
//! semaphore every `period` base ticks, and the service thread runs the
//! stage's `work` once per credit. The exit flag is checked after each
//! wait, so termination is observed on the release after the flag is set.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::clock;
use crate::logger;
use crate::pipeline::FramePipeline;
use crate::rt::{self, ThreadPolicy};
use crate::sync::Semaphore;

/// One stage of the pipeline. Implementations own their private state
/// (previous-frame copies, best-frame tokens, output counters); nothing
/// lives at file scope.
pub trait Stage: Send {
    fn setup(&mut self, pipeline: &FramePipeline) -> Result<()>;
    fn work(&mut self, pipeline: &FramePipeline, service: &Service, request: u64) -> Result<()>;
    fn teardown(&mut self, pipeline: &FramePipeline) -> Result<()>;
}

/// Immutable identity and placement of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: u32,
    pub name: String,
    /// Release period in base ticks. Must be at least 1.
    pub period: u32,
    /// CPU the service thread is pinned to.
    pub cpu: usize,
}

/// Shared runtime state of one service, visible to both the sequencer and
/// the service thread.
pub struct Service {
    spec: ServiceSpec,
    priority_descending: i32,
    exit_flag: AtomicBool,
    release: Semaphore,
    setup_done: Semaphore,
    released: AtomicU64,
    requests: AtomicU64,
    work_start_ns: AtomicU64,
    work_complete_ns: AtomicU64,
}

impl Service {
    pub fn new(spec: ServiceSpec, priority_descending: i32) -> Self {
        Self {
            spec,
            priority_descending,
            exit_flag: AtomicBool::new(false),
            release: Semaphore::new(0),
            setup_done: Semaphore::new(0),
            released: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            work_start_ns: AtomicU64::new(0),
            work_complete_ns: AtomicU64::new(0),
        }
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Descending rate-monotonic priority index; 1 is the highest.
    pub fn priority_descending(&self) -> i32 {
        self.priority_descending
    }

    /// Scheduled release from the sequencer: one work credit.
    pub fn request_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.release.post();
    }

    /// Termination release: raise the exit flag, then wake the thread once.
    pub fn release_for_exit(&self) {
        self.exit_flag.store(true, Ordering::Release);
        self.release.post();
    }

    /// Block until the service thread has finished its stage setup.
    pub fn await_setup(&self) {
        self.setup_done.wait();
    }

    /// Scheduled releases granted so far (termination not included).
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Work invocations completed or in progress.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn last_work_elapsed_seconds(&self) -> f64 {
        let start = self.work_start_ns.load(Ordering::Relaxed);
        let complete = self.work_complete_ns.load(Ordering::Relaxed);
        (complete.saturating_sub(start)) as f64 / clock::NANOSECONDS_PER_SECOND as f64
    }
}

/// Service thread body: bring-up, setup, then the release-driven work loop.
pub fn run_service(
    service: &Service,
    pipeline: &FramePipeline,
    stage: &mut dyn Stage,
    policy: ThreadPolicy,
) -> Result<()> {
    let spec = service.spec();
    let priority = rt::max_fifo_priority() - service.priority_descending();
    rt::apply(policy, spec.cpu, priority)
        .wrap_err_with(|| format!("real-time bring-up of service '{}'", spec.name))?;

    stage
        .setup(pipeline)
        .wrap_err_with(|| format!("setup of service '{}'", spec.name))?;
    service.setup_done.post();

    let mut request: u64 = 0;
    loop {
        service.release.wait();

        if service.exit_flag.load(Ordering::Acquire) {
            stage
                .teardown(pipeline)
                .wrap_err_with(|| format!("teardown of service '{}'", spec.name))?;
            return Ok(());
        }

        request += 1;
        service.requests.store(request, Ordering::Relaxed);

        let start = clock::monotonic_raw();
        service
            .work_start_ns
            .store(start.as_nanoseconds() as u64, Ordering::Relaxed);
        logger::write(
            service.priority_descending(),
            format_args!(
                "Service: {}, Service Name: {}, Request: {}, BEGIN",
                spec.id, spec.name, request
            ),
        );

        stage
            .work(pipeline, service, request)
            .wrap_err_with(|| format!("request {request} of service '{}'", spec.name))?;

        let complete = clock::monotonic_raw();
        service
            .work_complete_ns
            .store(complete.as_nanoseconds() as u64, Ordering::Relaxed);
        let elapsed = complete.since(start);
        logger::write(
            service.priority_descending(),
            format_args!(
                "Service: {}, Service Name: {}, Request: {}, DONE, Request Elapsed Time: {}.{:09}",
                spec.id, spec.name, request, elapsed.sec, elapsed.nsec
            ),
        );
        metrics::histogram!("service_work_seconds", "service" => spec.name.clone())
            .record(elapsed.as_seconds_f64());
    }
}

/// Start a service thread. A service failure is a fatal pipeline-invariant
/// breach, so the thread terminates the process rather than unwinding.
pub fn spawn_service(
    service: Arc<Service>,
    pipeline: Arc<FramePipeline>,
    mut stage: Box<dyn Stage>,
    policy: ThreadPolicy,
) -> Result<JoinHandle<()>> {
    let name = service.spec().name.clone();
    let thread_name = name.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if let Err(report) = run_service(&service, &pipeline, stage.as_mut(), policy) {
                error!("service '{thread_name}' failed: {report:#}");
                std::process::exit(1);
            }
        })
        .wrap_err_with(|| format!("pthread_create-equivalent for service '{name}'"))
}
