//! Integration tests for the scheduler.
//!
//! Each test builds a scheduler through the public API with in-memory
//! executors and checks ordering, draining and accounting end to end.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use opsched::config::{BackpressurePolicy, SchedulerConfig};
use opsched::error::SubmitError;
use opsched::worker::{
    ExecutorRegistry, FnExecutor, JobExecutor, JobOutput, Scheduler, SchedulerState, TaskEvent,
    TaskId, TaskListener, TaskRequest,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        worker_count: workers,
        poll_interval: Duration::from_millis(10),
        ..SchedulerConfig::default()
    }
}

async fn scheduler(
    config: SchedulerConfig,
    executors: Vec<(&str, Arc<dyn JobExecutor>)>,
) -> Arc<Scheduler> {
    let registry = ExecutorRegistry::with_builtins();
    for (kind, executor) in executors {
        registry.register(kind, executor).await;
    }
    Arc::new(Scheduler::new(config, Arc::new(registry)).unwrap())
}

/// Records the label (`args[0]`) of each task as it starts, then sleeps.
fn recorder(log: Arc<Mutex<Vec<String>>>, delay: Duration) -> Arc<dyn JobExecutor> {
    Arc::new(FnExecutor::new(move |req| {
        let log = Arc::clone(&log);
        Box::pin(async move {
            log.lock().unwrap().push(req.args[0].clone());
            tokio::time::sleep(delay).await;
            Ok(JobOutput::empty())
        })
    }))
}

/// Tracks peak concurrency across all executions.
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

fn gauged(gauge: Arc<Gauge>, delay: Duration) -> Arc<dyn JobExecutor> {
    Arc::new(FnExecutor::new(move |_| {
        let gauge = Arc::clone(&gauge);
        Box::pin(async move {
            let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
            gauge.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            gauge.current.fetch_sub(1, Ordering::SeqCst);
            Ok(JobOutput::empty())
        })
    }))
}

async fn next_events(rx: &mut UnboundedReceiver<TaskEvent>, n: usize) -> Vec<TaskEvent> {
    let mut events = Vec::with_capacity(n);
    while events.len() < n {
        let event = timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for task events")
            .expect("event stream closed");
        events.push(event);
    }
    events
}

fn labeled(kind: &str, label: &str) -> TaskRequest {
    TaskRequest::new(kind).with_args([label])
}

#[tokio::test]
async fn high_priority_runs_first_on_single_worker() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let scheduler = scheduler(
        config(1),
        vec![("test", recorder(Arc::clone(&log), Duration::from_millis(5)))],
    )
    .await;
    let mut rx = scheduler.subscribe();

    scheduler.submit(labeled("test", "A")).await.unwrap();
    scheduler.submit(labeled("test", "B")).await.unwrap();
    scheduler.submit(labeled("test", "C").high()).await.unwrap();

    scheduler.start().await.unwrap();
    next_events(&mut rx, 3).await;
    scheduler.stop().await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["C", "A", "B"]);
}

#[tokio::test]
async fn high_priority_dequeued_before_normal_with_two_workers() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let scheduler = scheduler(
        config(2),
        vec![("test", recorder(Arc::clone(&log), Duration::from_millis(50)))],
    )
    .await;
    let mut rx = scheduler.subscribe();

    scheduler.submit(labeled("test", "A")).await.unwrap();
    scheduler.submit(labeled("test", "B")).await.unwrap();
    scheduler.submit(labeled("test", "C").high()).await.unwrap();

    scheduler.start().await.unwrap();
    next_events(&mut rx, 3).await;
    scheduler.stop().await.unwrap();

    let log = log.lock().unwrap();
    let position = |label: &str| log.iter().position(|l| l == label).unwrap();
    assert!(position("C") < position("B"));
    assert!(position("A") < position("B"));
}

#[tokio::test]
async fn single_worker_runs_tasks_sequentially() {
    let scheduler = scheduler(config(1), Vec::new()).await;
    let mut rx = scheduler.subscribe();
    scheduler.start().await.unwrap();

    let started = Instant::now();
    let mut submitted = Vec::new();
    for _ in 0..3 {
        let id = scheduler
            .submit(TaskRequest::new("sleep").with_args(["100"]))
            .await
            .unwrap();
        submitted.push(id);
    }

    let events = next_events(&mut rx, 3).await;
    assert!(started.elapsed() >= Duration::from_millis(300));

    let completed: Vec<TaskId> = events.iter().map(|e| e.task().id.clone()).collect();
    assert_eq!(completed, submitted);
    assert!(events.iter().all(TaskEvent::is_success));
    assert!(events.iter().all(|e| e.worker_id() == 0));

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_job_type_fails_without_crashing() {
    let scheduler = scheduler(config(2), Vec::new()).await;
    let mut rx = scheduler.subscribe();
    scheduler.start().await.unwrap();

    let id = scheduler.submit(TaskRequest::new("bogus")).await.unwrap();
    let events = next_events(&mut rx, 1).await;

    match &events[0] {
        TaskEvent::Failed { task, error, .. } => {
            assert_eq!(task.id, id);
            assert!(error.contains("bogus"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // Scheduler keeps working after the failure
    scheduler
        .submit(TaskRequest::new("echo").with_args(["still alive"]))
        .await
        .unwrap();
    let events = next_events(&mut rx, 1).await;
    assert!(events[0].is_success());

    scheduler.stop().await.unwrap();
    let stats = scheduler.stats().await;
    assert_eq!(stats.error_count, 1);
    assert_eq!(stats.success_count, 1);
}

#[tokio::test]
async fn stop_on_idle_scheduler_is_immediate() {
    let scheduler = scheduler(config(4), Vec::new()).await;
    scheduler.start().await.unwrap();

    let started = Instant::now();
    timeout(TEST_TIMEOUT, scheduler.stop())
        .await
        .unwrap()
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    let status = scheduler.status().await;
    assert_eq!(status.state, SchedulerState::Stopped);
    assert_eq!(status.queue_size, 0);
    assert_eq!(status.active_workers, 0);
}

#[tokio::test]
async fn concurrent_producers_lose_nothing() {
    let counter = Arc::new(AtomicUsize::new(0));
    let counted: Arc<dyn JobExecutor> = {
        let counter = Arc::clone(&counter);
        Arc::new(FnExecutor::from_sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(JobOutput::empty())
        }))
    };
    let scheduler = scheduler(config(4), vec![("count", counted)]).await;
    let mut rx = scheduler.subscribe();
    scheduler.start().await.unwrap();

    let producers: Vec<_> = (0..10)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..10 {
                    ids.push(scheduler.submit(TaskRequest::new("count")).await.unwrap());
                }
                ids
            })
        })
        .collect();

    let mut submitted = HashSet::new();
    for producer in producers {
        submitted.extend(producer.await.unwrap());
    }
    assert_eq!(submitted.len(), 100);

    scheduler.stop().await.unwrap();

    let events = next_events(&mut rx, 100).await;
    let finished: HashSet<TaskId> = events.iter().map(|e| e.task().id.clone()).collect();
    assert_eq!(finished, submitted);
    assert!(rx.try_recv().is_err(), "each task reports exactly once");

    let stats = scheduler.stats().await;
    assert_eq!(stats.total_processed, 100);
    assert_eq!(stats.success_count, 100);
    assert_eq!(stats.error_count, 0);
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn stop_drains_queued_work() {
    let gauge = Arc::new(Gauge {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let scheduler = scheduler(
        config(3),
        vec![("work", gauged(Arc::clone(&gauge), Duration::from_millis(20)))],
    )
    .await;
    scheduler.start().await.unwrap();

    for _ in 0..30 {
        scheduler.submit(TaskRequest::new("work")).await.unwrap();
    }
    timeout(TEST_TIMEOUT, scheduler.stop())
        .await
        .unwrap()
        .unwrap();

    let stats = scheduler.stats().await;
    assert_eq!(stats.total_processed, 30);
    assert_eq!(stats.queue_size, 0);
    assert_eq!(stats.active_workers, 0);
    assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn every_worker_takes_part_under_load() {
    let gauge = Arc::new(Gauge {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let scheduler = scheduler(
        config(4),
        vec![("work", gauged(Arc::clone(&gauge), Duration::from_millis(30)))],
    )
    .await;
    let mut rx = scheduler.subscribe();

    for _ in 0..12 {
        scheduler.submit(TaskRequest::new("work")).await.unwrap();
    }
    scheduler.start().await.unwrap();
    let events = next_events(&mut rx, 12).await;
    scheduler.stop().await.unwrap();

    let workers: HashSet<usize> = events.iter().map(TaskEvent::worker_id).collect();
    assert_eq!(workers.len(), 4);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 4);

    let processed: u64 = scheduler.workers().iter().map(|w| w.processed_count).sum();
    assert_eq!(processed, 12);
}

#[tokio::test]
async fn block_policy_admits_everything_eventually() {
    let scheduler = scheduler(
        SchedulerConfig {
            queue_capacity: Some(2),
            backpressure: BackpressurePolicy::Block,
            ..config(1)
        },
        Vec::new(),
    )
    .await;
    scheduler.start().await.unwrap();

    let producer = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            for _ in 0..8 {
                scheduler
                    .submit(TaskRequest::new("sleep").with_args(["5"]))
                    .await
                    .unwrap();
            }
        })
    };
    timeout(TEST_TIMEOUT, producer).await.unwrap().unwrap();
    scheduler.stop().await.unwrap();

    assert_eq!(scheduler.stats().await.total_processed, 8);
}

#[tokio::test]
async fn reject_policy_reports_full_queue() {
    let scheduler = scheduler(
        SchedulerConfig {
            queue_capacity: Some(3),
            backpressure: BackpressurePolicy::Reject,
            ..config(1)
        },
        Vec::new(),
    )
    .await;

    for _ in 0..3 {
        scheduler.submit(TaskRequest::new("echo")).await.unwrap();
    }
    let err = scheduler.submit(TaskRequest::new("echo")).await.unwrap_err();
    assert_eq!(err, SubmitError::QueueFull { capacity: 3 });

    scheduler.start().await.unwrap();
    scheduler.stop().await.unwrap();
    assert_eq!(scheduler.stats().await.total_processed, 3);
}

#[tokio::test]
async fn echo_returns_payload() {
    let scheduler = scheduler(config(1), Vec::new()).await;
    let mut rx = scheduler.subscribe();
    scheduler.start().await.unwrap();

    scheduler
        .submit(
            TaskRequest::new("echo")
                .with_payload(serde_json::json!({ "project": "opsched" }))
                .with_args(["x"]),
        )
        .await
        .unwrap();

    match next_events(&mut rx, 1).await.remove(0) {
        TaskEvent::Completed { result, .. } => {
            assert_eq!(result["payload"]["project"], "opsched");
            assert_eq!(result["args"][0], "x");
        }
        other => panic!("expected completion, got {other:?}"),
    }
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn shell_job_captures_output() {
    let scheduler = scheduler(config(1), Vec::new()).await;
    let mut rx = scheduler.subscribe();
    scheduler.start().await.unwrap();

    scheduler
        .submit(TaskRequest::new("shell").with_args(["echo hello-from-shell"]))
        .await
        .unwrap();
    scheduler
        .submit(TaskRequest::new("shell").with_args(["exit 3"]))
        .await
        .unwrap();

    let events = next_events(&mut rx, 2).await;
    scheduler.stop().await.unwrap();

    match &events[0] {
        TaskEvent::Completed { result, .. } => {
            assert!(result["output"].as_str().unwrap().contains("hello-from-shell"));
            assert_eq!(result["exit_code"], 0);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    match &events[1] {
        TaskEvent::Failed { error, .. } => assert!(error.contains("exit code 3"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn counters_are_conserved_with_mixed_outcomes() {
    let flaky: Arc<dyn JobExecutor> = Arc::new(FnExecutor::from_sync(|req| {
        let n: u32 = req.args[0].parse().unwrap_or(0);
        if n % 3 == 0 {
            Err(req.fail("multiple of three"))
        } else {
            Ok(JobOutput::empty())
        }
    }));
    let scheduler = scheduler(config(3), vec![("flaky", flaky)]).await;
    scheduler.start().await.unwrap();

    for n in 0..30 {
        scheduler
            .submit(TaskRequest::new("flaky").with_args([n.to_string()]))
            .await
            .unwrap();
    }
    scheduler.stop().await.unwrap();

    let stats = scheduler.stats().await;
    assert_eq!(stats.total_processed, 30);
    assert_eq!(stats.error_count, 10);
    assert_eq!(stats.success_count + stats.error_count, stats.total_processed);
}

/// Listener that panics on every event.
struct Exploding;

impl TaskListener for Exploding {
    fn on_event(&self, _event: &TaskEvent) {
        panic!("listener exploded");
    }
}

#[tokio::test]
async fn panicking_listener_does_not_leak_workers() {
    let scheduler = scheduler(config(1), Vec::new()).await;
    scheduler.add_listener(Arc::new(Exploding));
    let mut rx = scheduler.subscribe();
    scheduler.start().await.unwrap();

    for _ in 0..3 {
        scheduler.submit(TaskRequest::new("echo")).await.unwrap();
    }
    let events = next_events(&mut rx, 3).await;
    assert!(events.iter().all(TaskEvent::is_success));

    timeout(TEST_TIMEOUT, scheduler.stop())
        .await
        .expect("stop should not hang on a leaked worker")
        .unwrap();

    let status = scheduler.status().await;
    assert_eq!(status.active_workers, 0);
    assert_eq!(scheduler.stats().await.total_processed, 3);
}

#[tokio::test]
async fn blocked_producer_is_run_or_rejected_on_drain() {
    let scheduler = scheduler(
        SchedulerConfig {
            queue_capacity: Some(1),
            backpressure: BackpressurePolicy::Block,
            ..config(1)
        },
        Vec::new(),
    )
    .await;
    let mut rx = scheduler.subscribe();
    scheduler.start().await.unwrap();

    let first = scheduler
        .submit(TaskRequest::new("sleep").with_args(["150"]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = scheduler
        .submit(TaskRequest::new("sleep").with_args(["10"]))
        .await
        .unwrap();

    let producer = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            scheduler
                .submit(TaskRequest::new("sleep").with_args(["10"]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    timeout(TEST_TIMEOUT, scheduler.stop())
        .await
        .unwrap()
        .unwrap();
    let third = timeout(TEST_TIMEOUT, producer).await.unwrap().unwrap();

    let mut accepted = vec![first, second];
    match third {
        Ok(id) => accepted.push(id),
        Err(e) => assert_eq!(e, SubmitError::Draining),
    }

    // Every accepted task ran before stop returned; nothing is left behind
    let stats = scheduler.stats().await;
    assert_eq!(stats.total_processed, accepted.len() as u64);
    assert_eq!(stats.queue_size, 0);

    let events = next_events(&mut rx, accepted.len()).await;
    let finished: HashSet<TaskId> = events.iter().map(|e| e.task().id.clone()).collect();
    let accepted: HashSet<TaskId> = accepted.into_iter().collect();
    assert_eq!(finished, accepted);
}

#[tokio::test]
async fn no_task_is_held_by_two_workers() {
    let gauge = Arc::new(Gauge {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let scheduler = scheduler(
        config(4),
        vec![("work", gauged(Arc::clone(&gauge), Duration::from_millis(5)))],
    )
    .await;
    scheduler.start().await.unwrap();

    for _ in 0..60 {
        scheduler.submit(TaskRequest::new("work")).await.unwrap();
    }

    let mut samples = 0;
    let deadline = Instant::now() + TEST_TIMEOUT;
    while scheduler.stats().await.total_processed < 60 && Instant::now() < deadline {
        let held: Vec<TaskId> = scheduler
            .workers()
            .into_iter()
            .filter_map(|w| w.current_task)
            .collect();
        let unique: HashSet<&TaskId> = held.iter().collect();
        assert_eq!(unique.len(), held.len(), "task bound to two workers: {held:?}");
        samples += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    scheduler.stop().await.unwrap();
    assert!(samples > 0);
    assert_eq!(scheduler.stats().await.total_processed, 60);
}
