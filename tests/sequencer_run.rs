//! End-to-end sequencer behavior: release accounting, rate-monotonic
//! ordering, and the termination protocol. All runs use stub stages and
//! `ThreadPolicy::Normal` so no privileges are needed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use color_eyre::eyre::Result;
use realtimely::pipeline::{FramePipeline, PipelineConfig};
use realtimely::sequencer::{Runtime, Schedule, ScheduleSpec};
use realtimely::service::{Service, ServiceSpec, Stage};
use realtimely::ThreadPolicy;

#[derive(Clone, Default)]
struct Counters {
    setups: Arc<AtomicU64>,
    works: Arc<AtomicU64>,
    teardowns: Arc<AtomicU64>,
}

impl Counters {
    fn setups(&self) -> u64 {
        self.setups.load(Ordering::SeqCst)
    }
    fn works(&self) -> u64 {
        self.works.load(Ordering::SeqCst)
    }
    fn teardowns(&self) -> u64 {
        self.teardowns.load(Ordering::SeqCst)
    }
}

struct CountingStage {
    counters: Counters,
}

impl Stage for CountingStage {
    fn setup(&mut self, _pipeline: &FramePipeline) -> Result<()> {
        self.counters.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn work(&mut self, _pipeline: &FramePipeline, _service: &Service, _request: u64) -> Result<()> {
        self.counters.works.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn teardown(&mut self, _pipeline: &FramePipeline) -> Result<()> {
        self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        frame_count: 4,
        width: 8,
        height: 8,
        blur: false,
    }
}

fn schedule_spec(frequency: f64, max_iterations: u64) -> ScheduleSpec {
    ScheduleSpec {
        frequency,
        max_iterations,
        sequencer_cpu: 0,
        policy: ThreadPolicy::Normal,
    }
}

fn counting_service(
    schedule: Schedule,
    id: u32,
    name: &str,
    period: u32,
) -> (Schedule, Counters) {
    let counters = Counters::default();
    let schedule = schedule.with_service(
        ServiceSpec {
            id,
            name: name.into(),
            period,
            cpu: 0,
        },
        Box::new(CountingStage {
            counters: counters.clone(),
        }),
    );
    (schedule, counters)
}

#[test]
fn release_counts_follow_the_period_formula() {
    // 60 iterations with periods [1, 3, 3]: ceil(60/1) = 60 releases,
    // ceil(60/3) = 20 for each of the others.
    let (schedule, fast) = counting_service(
        Schedule::new(schedule_spec(400.0, 60)),
        1,
        "every-tick",
        1,
    );
    let (schedule, slow_a) = counting_service(schedule, 2, "every-third-a", 3);
    let (schedule, slow_b) = counting_service(schedule, 3, "every-third-b", 3);

    let runtime = Runtime::new(schedule, pipeline_config()).unwrap();
    let report = runtime.run().unwrap();

    assert_eq!(report.iterations, 60);
    let released: Vec<u64> = report.services.iter().map(|s| s.released).collect();
    assert_eq!(released, vec![60, 20, 20]);

    // Credits granted on the final tick race the exit flag and may be
    // dropped; everything earlier must have been worked off one-for-one.
    assert!(fast.works() >= 59 && fast.works() <= 60, "{}", fast.works());
    assert!(slow_a.works() >= 19 && slow_a.works() <= 20);
    assert!(slow_b.works() >= 19 && slow_b.works() <= 20);
}

#[test]
fn priorities_are_rate_monotonic_with_stable_ties() {
    let (schedule, _a) = counting_service(
        Schedule::new(schedule_spec(400.0, 30)),
        1,
        "slow",
        30,
    );
    let (schedule, _b) = counting_service(schedule, 2, "fast", 5);
    let (schedule, _c) = counting_service(schedule, 3, "fast-too", 5);

    let runtime = Runtime::new(schedule, pipeline_config()).unwrap();
    let report = runtime.run().unwrap();

    let order: Vec<(&str, u32, i32)> = report
        .services
        .iter()
        .map(|s| (s.name.as_str(), s.period, s.priority_descending))
        .collect();
    assert_eq!(
        order,
        vec![("fast", 5, 1), ("fast-too", 5, 2), ("slow", 30, 3)]
    );
    for window in report.services.windows(2) {
        assert!(window[0].period <= window[1].period);
        assert!(window[0].priority_descending < window[1].priority_descending);
    }
}

#[test]
fn termination_disarms_the_timer_and_runs_teardown_once() {
    let (schedule, counters) = counting_service(
        Schedule::new(schedule_spec(400.0, 5)),
        1,
        "short-run",
        1,
    );

    let runtime = Runtime::new(schedule, pipeline_config()).unwrap();
    let report = runtime.run().unwrap();

    assert_eq!(report.iterations, 5);
    assert_eq!(counters.setups(), 1);
    assert_eq!(counters.teardowns(), 1);
    assert_eq!(report.services[0].released, 5);

    // No ticks fire after the run returns.
    let works_at_join = counters.works();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(counters.works(), works_at_join);
}

#[test]
fn zero_iterations_still_sets_up_and_tears_down() {
    let (schedule, counters) = counting_service(
        Schedule::new(schedule_spec(400.0, 0)),
        1,
        "no-work",
        1,
    );

    let runtime = Runtime::new(schedule, pipeline_config()).unwrap();
    let report = runtime.run().unwrap();

    assert_eq!(report.iterations, 0);
    assert_eq!(counters.setups(), 1);
    assert_eq!(counters.works(), 0);
    assert_eq!(counters.teardowns(), 1);
    assert_eq!(report.services[0].released, 0);
}

#[test]
fn period_equal_to_run_length_releases_once() {
    let (schedule, counters) = counting_service(
        Schedule::new(schedule_spec(400.0, 7)),
        1,
        "once",
        7,
    );

    let runtime = Runtime::new(schedule, pipeline_config()).unwrap();
    let report = runtime.run().unwrap();

    assert_eq!(report.services[0].released, 1);
    assert_eq!(counters.works(), 1);
}

#[test]
fn period_longer_than_the_run_is_not_an_error() {
    let (schedule, counters) = counting_service(
        Schedule::new(schedule_spec(400.0, 10)),
        1,
        "barely-runs",
        100,
    );

    let runtime = Runtime::new(schedule, pipeline_config()).unwrap();
    let report = runtime.run().unwrap();

    // Only the release at iteration 0.
    assert_eq!(report.services[0].released, 1);
    assert_eq!(counters.works(), 1);
}

#[test]
fn realtime_refusal_precedes_thread_creation() {
    // Probe privileges on a scratch thread so this test thread's own
    // scheduling is untouched. With CAP_SYS_NICE there is nothing to refuse.
    let privileged = thread::spawn(|| {
        realtimely::rt::set_current_thread_fifo(realtimely::rt::max_fifo_priority()).is_ok()
    })
    .join()
    .unwrap();
    if privileged {
        return;
    }

    let (schedule, counters) = counting_service(
        Schedule::new(ScheduleSpec {
            frequency: 400.0,
            max_iterations: 10,
            sequencer_cpu: 0,
            policy: ThreadPolicy::Realtime,
        }),
        1,
        "refused",
        1,
    );

    let runtime = Runtime::new(schedule, pipeline_config()).unwrap();
    assert!(runtime.run().is_err());
    // Refusal happened before any service thread was created.
    assert_eq!(counters.setups(), 0);
    assert_eq!(counters.teardowns(), 0);
}

#[test]
fn invalid_schedules_never_start_threads() {
    let (schedule, counters) = counting_service(
        Schedule::new(schedule_spec(400.0, 10)),
        1,
        "never-runs",
        0,
    );
    assert!(Runtime::new(schedule, pipeline_config()).is_err());
    assert_eq!(counters.setups(), 0);

    let (schedule, _) = counting_service(
        Schedule::new(schedule_spec(-1.0, 10)),
        1,
        "bad-frequency",
        1,
    );
    assert!(Runtime::new(schedule, pipeline_config()).is_err());
}
