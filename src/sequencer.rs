//! The sequencer: rate-monotonic priority assignment and the periodic
//! release loop.
//!
//! The release source is a dedicated absolute-deadline timer on the
//! sequencer thread rather than a signal handler, so posting release
//! semaphores is ordinary code and the tick cadence is immune to handler
//! runtime. The sequencer thread itself runs at the top of the SCHED_FIFO
//! range on its own CPU.

use std::sync::Arc;
use std::thread::JoinHandle;

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{self, IntervalTimer};
use crate::logger;
use crate::pipeline::{FramePipeline, PipelineConfig};
use crate::rt::{self, ThreadPolicy};
use crate::service::{spawn_service, Service, ServiceSpec, Stage};

/// Timing parameters of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Base tick rate in Hz. Service periods are integer multiples of the
    /// base tick.
    pub frequency: f64,
    /// Ticks to run before terminating all services.
    pub max_iterations: u64,
    /// CPU the sequencer thread is pinned to.
    pub sequencer_cpu: usize,
    pub policy: ThreadPolicy,
}

/// A service and the stage it runs.
pub struct ServiceEntry {
    pub spec: ServiceSpec,
    pub stage: Box<dyn Stage>,
}

/// A full schedule: timing plus the ordered service set.
pub struct Schedule {
    pub spec: ScheduleSpec,
    pub entries: Vec<ServiceEntry>,
}

impl Schedule {
    pub fn new(spec: ScheduleSpec) -> Self {
        Self {
            spec,
            entries: Vec::new(),
        }
    }

    pub fn with_service(mut self, spec: ServiceSpec, stage: Box<dyn Stage>) -> Self {
        self.entries.push(ServiceEntry { spec, stage });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.spec.frequency > 0.0) || !self.spec.frequency.is_finite() {
            return Err(eyre!(
                "schedule frequency must be positive, got {}",
                self.spec.frequency
            ));
        }
        if self.entries.is_empty() {
            return Err(eyre!("schedule has no services"));
        }
        for entry in &self.entries {
            if entry.spec.period == 0 {
                return Err(eyre!(
                    "service '{}' has period 0; periods are in base ticks and must be at least 1",
                    entry.spec.name
                ));
            }
        }
        Ok(())
    }

    /// Sort services shortest-period-first. The sort is stable, so services
    /// with equal periods keep their declaration order and the earlier one
    /// receives the higher priority.
    pub fn assign_priorities(&mut self) {
        self.entries.sort_by_key(|entry| entry.spec.period);
    }
}

/// Build the shared service descriptors for priority-sorted entries:
/// `priority_descending` is the 1-based position in the sorted order.
pub fn services_from_entries(entries: &[ServiceEntry]) -> Vec<Arc<Service>> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| Arc::new(Service::new(entry.spec.clone(), index as i32 + 1)))
        .collect()
}

/// Outcome of one completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub iterations: u64,
    pub elapsed_seconds: f64,
    pub services: Vec<ServiceReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub id: u32,
    pub name: String,
    pub period: u32,
    pub priority_descending: i32,
    pub released: u64,
    pub requests: u64,
}

/// Everything one run needs: the schedule and the frame pipeline it drives.
pub struct Runtime {
    schedule: Schedule,
    pipeline: Arc<FramePipeline>,
}

impl Runtime {
    pub fn new(schedule: Schedule, pipeline_config: PipelineConfig) -> Result<Self> {
        schedule.validate()?;
        let pipeline = Arc::new(FramePipeline::new(pipeline_config)?);
        Ok(Self { schedule, pipeline })
    }

    /// The pipeline, for post-run inspection.
    pub fn pipeline(&self) -> Arc<FramePipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Run the schedule to completion: bring-up, release loop, termination,
    /// join. Returns after every service thread has exited.
    pub fn run(mut self) -> Result<RunReport> {
        let spec = self.schedule.spec.clone();

        // The sequencer must own the top of the priority range before any
        // service exists; refusal happens with zero threads started.
        rt::promote_to_max_fifo(spec.policy, spec.sequencer_cpu)
            .wrap_err("sequencer real-time bring-up")?;

        self.schedule.assign_priorities();
        let services = services_from_entries(&self.schedule.entries);

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(services.len());
        for (service, entry) in services.iter().zip(self.schedule.entries.drain(..)) {
            handles.push(spawn_service(
                Arc::clone(service),
                Arc::clone(&self.pipeline),
                entry.stage,
                spec.policy,
            )?);
        }

        // No releases before every stage has finished its setup.
        for service in &services {
            service.await_setup();
        }
        logger::write(
            0,
            format_args!(
                "Sequencer armed: {} services at {} Hz for {} iterations",
                services.len(),
                spec.frequency,
                spec.max_iterations
            ),
        );

        let mut timer = IntervalTimer::from_frequency(spec.frequency)?;
        let run_start = clock::monotonic_raw();

        let mut iteration: u64 = 0;
        while iteration < spec.max_iterations {
            timer.wait_tick()?;
            debug!("Sequencer: {iteration}");

            // Iteration 0 releases every service: every period divides 0.
            for service in &services {
                if iteration % service.spec().period as u64 == 0 {
                    service.request_release();
                }
            }
            iteration += 1;
        }

        // Termination: stop granting releases, then wake every service
        // exactly once with its exit flag raised.
        for service in &services {
            service.release_for_exit();
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| eyre!("pthread_join-equivalent failed: service thread panicked"))?;
        }

        let elapsed = clock::monotonic_raw().since(run_start);
        let report = RunReport {
            iterations: iteration,
            elapsed_seconds: elapsed.as_seconds_f64(),
            services: services
                .iter()
                .map(|service| ServiceReport {
                    id: service.spec().id,
                    name: service.spec().name.clone(),
                    period: service.spec().period,
                    priority_descending: service.priority_descending(),
                    released: service.released(),
                    requests: service.requests(),
                })
                .collect(),
        };
        logger::write(
            0,
            format_args!(
                "Sequencer complete: {} iterations in {:.3} s",
                report.iterations, report.elapsed_seconds
            ),
        );
        Ok(report)
    }
}
