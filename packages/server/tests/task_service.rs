//! End-to-end task engine tests against in-memory stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use scheduler_core::common::InstanceId;
use scheduler_core::kernel::tasks::{
    HandlerDescriptor, HandlerRegistry, MemoryTaskStore, StorageMode, Task, TaskDraft, TaskPatch,
    TaskRunResult, TaskScheduleType, TaskService, TaskStatus, TaskStore,
};
use scheduler_core::SchedulerConfig;
use serde_json::json;

struct Harness {
    service: TaskService,
    persisted: Arc<MemoryTaskStore>,
    registry: Arc<HandlerRegistry>,
}

fn build() -> Harness {
    build_with_config(SchedulerConfig::default(), InstanceId::generate())
}

fn build_with_config(config: SchedulerConfig, instance_id: InstanceId) -> Harness {
    let persisted = Arc::new(MemoryTaskStore::with_mode(StorageMode::Persisted));
    let registry = Arc::new(HandlerRegistry::new());
    let service = TaskService::new(
        persisted.clone(),
        Arc::new(MemoryTaskStore::new()),
        registry.clone(),
        config,
        instance_id,
    );
    Harness {
        service,
        persisted,
        registry,
    }
}

/// Poll the named task until the condition holds, panicking on timeout.
async fn wait_for_task<F>(
    service: &TaskService,
    name: &str,
    timeout_ms: u64,
    condition: F,
) -> Task
where
    F: Fn(&Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + StdDuration::from_millis(timeout_ms);
    loop {
        let task = service.get_task(name).await.unwrap();
        if condition(&task) {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "task \"{}\" did not reach the expected state within {}ms: {:?}",
                name, timeout_ms, task
            );
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
}

fn due_interval_task(name: &str, interval_seconds: i64) -> TaskDraft {
    TaskDraft::builder()
        .name(name)
        .task_type("counting")
        .schedule_type(TaskScheduleType::Interval)
        .interval_seconds(interval_seconds)
        .next_run_at(Utc::now() - Duration::milliseconds(10))
        .build()
}

fn counting_handler(registry: &HandlerRegistry, task_type: &str) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let calls = counter.clone();
    registry
        .register_fn(task_type, move |_task, _cancel| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(TaskRunResult::ok())
            }
        })
        .unwrap();
    counter
}

#[tokio::test]
async fn interval_task_runs_and_reschedules() {
    let h = build();
    let calls = counting_handler(&h.registry, "counting");
    h.service
        .register_task(due_interval_task("t", 60))
        .await
        .unwrap();

    let before = Utc::now();
    h.service.tick().await;

    let done = wait_for_task(&h.service, "t", 2_000, |t| t.last_run_at.is_some()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(done.status, TaskStatus::Idle);
    assert_eq!(done.consecutive_failures, 0);
    assert!(done.run_started_at.is_none());
    assert!(done.process_instance_id.is_none());
    let next = done.next_run_at.unwrap();
    assert!(next >= before + Duration::seconds(59));
    assert!(next <= Utc::now() + Duration::seconds(61));
}

#[tokio::test]
async fn one_off_task_runs_once_and_stops() {
    let h = build();
    let calls = counting_handler(&h.registry, "counting");
    h.service
        .register_task(
            TaskDraft::builder()
                .name("once")
                .task_type("counting")
                .schedule_type(TaskScheduleType::OneOff)
                .scheduled_at(Utc::now() - Duration::milliseconds(10))
                .build(),
        )
        .await
        .unwrap();

    h.service.tick().await;
    let done = wait_for_task(&h.service, "once", 2_000, |t| t.last_run_at.is_some()).await;
    assert!(done.next_run_at.is_none());

    // Further ticks find nothing due.
    h.service.tick().await;
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handler_receives_the_task_snapshot() {
    let h = build();
    let seen = Arc::new(std::sync::Mutex::new(None::<Task>));
    let capture = seen.clone();
    h.registry
        .register_fn("inspect", move |task, _cancel| {
            let capture = capture.clone();
            async move {
                *capture.lock().unwrap() = Some(task);
                Ok(TaskRunResult::ok())
            }
        })
        .unwrap();

    h.service
        .register_task(
            TaskDraft::builder()
                .name("inspected")
                .task_type("inspect")
                .schedule_type(TaskScheduleType::Dynamic)
                .next_run_at(Utc::now() - Duration::milliseconds(10))
                .payload(json!({"target": 7}))
                .build(),
        )
        .await
        .unwrap();

    h.service.tick().await;
    wait_for_task(&h.service, "inspected", 2_000, |t| t.last_run_at.is_some()).await;

    let task = seen.lock().unwrap().clone().unwrap();
    assert_eq!(task.name, "inspected");
    assert_eq!(task.payload, Some(json!({"target": 7})));
    // The snapshot reflects the claimed row.
    assert_eq!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn dynamic_task_uses_handler_supplied_next_run() {
    let h = build();
    let target = Utc::now() + Duration::seconds(300);
    h.registry
        .register_fn("reschedule", move |_task, _cancel| async move {
            Ok(TaskRunResult::ok().with_next_run_at(target))
        })
        .unwrap();

    h.service
        .register_task(
            TaskDraft::builder()
                .name("dyn")
                .task_type("reschedule")
                .schedule_type(TaskScheduleType::Dynamic)
                .next_run_at(Utc::now() - Duration::milliseconds(10))
                .build(),
        )
        .await
        .unwrap();

    h.service.tick().await;
    let done = wait_for_task(&h.service, "dyn", 2_000, |t| t.last_run_at.is_some()).await;
    assert_eq!(done.next_run_at, Some(target));
}

#[tokio::test]
async fn failing_handler_disables_task_at_threshold() {
    let h = build();
    h.registry
        .register(
            "flaky",
            HandlerDescriptor::new(|_task, _cancel| async {
                Ok(TaskRunResult::failure("boom"))
            })
            .with_max_consecutive_failures(2),
        )
        .unwrap();

    h.service
        .register_task(
            TaskDraft::builder()
                .name("flaky-task")
                .task_type("flaky")
                .schedule_type(TaskScheduleType::Interval)
                .interval_seconds(60i64)
                .next_run_at(Utc::now() - Duration::milliseconds(10))
                .build(),
        )
        .await
        .unwrap();

    h.service.tick().await;
    let first = wait_for_task(&h.service, "flaky-task", 2_000, |t| {
        t.consecutive_failures == 1
    })
    .await;
    assert_eq!(first.status, TaskStatus::Idle);
    assert_eq!(first.last_error.as_deref(), Some("boom"));
    assert!(first.next_run_at.is_some(), "a retry should be scheduled");

    // Pull the retry into the present and fail again: threshold reached.
    h.service
        .update_task(
            "flaky-task",
            TaskPatch {
                next_run_at: Some(Some(Utc::now() - Duration::milliseconds(10))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.service.tick().await;

    let disabled = wait_for_task(&h.service, "flaky-task", 2_000, |t| {
        t.status == TaskStatus::Disabled
    })
    .await;
    assert_eq!(disabled.consecutive_failures, 2);
    assert!(disabled.next_run_at.is_none());
}

#[tokio::test]
async fn handler_timeout_is_recorded_as_failure() {
    let h = build();
    h.registry
        .register(
            "slow",
            HandlerDescriptor::new(|_task, _cancel| async {
                tokio::time::sleep(StdDuration::from_secs(30)).await;
                Ok(TaskRunResult::ok())
            })
            .with_timeout_ms(50),
        )
        .unwrap();

    h.service
        .register_task(
            TaskDraft::builder()
                .name("slow-task")
                .task_type("slow")
                .schedule_type(TaskScheduleType::Interval)
                .interval_seconds(60i64)
                .next_run_at(Utc::now() - Duration::milliseconds(10))
                .build(),
        )
        .await
        .unwrap();

    h.service.tick().await;
    let done = wait_for_task(&h.service, "slow-task", 2_000, |t| t.last_run_at.is_some()).await;
    assert_eq!(done.last_error.as_deref(), Some("timeout"));
    assert_eq!(done.consecutive_failures, 1);
    assert_eq!(done.status, TaskStatus::Idle);
}

#[tokio::test]
async fn panicking_handler_is_an_ordinary_failure() {
    let h = build();
    h.registry
        .register_fn("exploding", |_task, _cancel| async {
            if Utc::now().timestamp() != 0 {
                panic!("handler blew up");
            }
            Ok(TaskRunResult::ok())
        })
        .unwrap();

    h.service
        .register_task(
            TaskDraft::builder()
                .name("exploder")
                .task_type("exploding")
                .schedule_type(TaskScheduleType::Interval)
                .interval_seconds(60i64)
                .next_run_at(Utc::now() - Duration::milliseconds(10))
                .build(),
        )
        .await
        .unwrap();

    h.service.tick().await;
    let done = wait_for_task(&h.service, "exploder", 2_000, |t| t.last_run_at.is_some()).await;
    assert_eq!(done.consecutive_failures, 1);
    assert!(done.last_error.unwrap().contains("panicked"));
}

#[tokio::test]
async fn claimed_task_is_not_executed_again() {
    let h = build();
    let calls = counting_handler(&h.registry, "counting");
    h.service
        .register_task(due_interval_task("t", 60))
        .await
        .unwrap();

    // Another claimant (a hung run, say) holds the row.
    h.persisted.claim("t", "sched-elsewhere").await.unwrap();

    h.service.tick().await;
    tokio::time::sleep(StdDuration::from_millis(150)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unregistered_task_type_is_skipped() {
    let h = build();
    h.service
        .register_task(
            TaskDraft::builder()
                .name("nobody-home")
                .task_type("unknown")
                .schedule_type(TaskScheduleType::Interval)
                .interval_seconds(60i64)
                .next_run_at(Utc::now() - Duration::milliseconds(10))
                .build(),
        )
        .await
        .unwrap();

    h.service.tick().await;
    tokio::time::sleep(StdDuration::from_millis(100)).await;

    // Not run, not advanced: a handler registered later still picks it up.
    let task = h.service.get_task("nobody-home").await.unwrap();
    assert!(task.last_run_at.is_none());
    assert_eq!(task.status, TaskStatus::Idle);

    let calls = counting_handler(&h.registry, "unknown");
    h.service.tick().await;
    wait_for_task(&h.service, "nobody-home", 2_000, |t| t.last_run_at.is_some()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn should_run_false_advances_without_executing() {
    let h = build();
    let calls = Arc::new(AtomicUsize::new(0));
    let count = calls.clone();
    h.registry
        .register(
            "gated",
            HandlerDescriptor::new(move |_task, _cancel| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(TaskRunResult::ok())
                }
            })
            .with_should_run(|_| false),
        )
        .unwrap();

    h.service
        .register_task(
            TaskDraft::builder()
                .name("gated-task")
                .task_type("gated")
                .schedule_type(TaskScheduleType::Interval)
                .interval_seconds(60i64)
                .next_run_at(Utc::now() - Duration::milliseconds(10))
                .build(),
        )
        .await
        .unwrap();

    h.service.tick().await;
    let skipped =
        wait_for_task(&h.service, "gated-task", 2_000, |t| t.last_run_at.is_some()).await;

    // The handler never ran, but the schedule advanced as if it had.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(skipped.next_run_at.unwrap() > Utc::now());
    assert_eq!(skipped.consecutive_failures, 0);
}

#[tokio::test]
async fn orphaned_tasks_are_reset_at_startup() {
    let h = build_with_config(
        SchedulerConfig::default(),
        InstanceId::from_string("sched-NEW"),
    );

    // A persisted task left running by a crashed prior instance.
    let draft = TaskDraft::builder()
        .name("orphan")
        .task_type("counting")
        .schedule_type(TaskScheduleType::Interval)
        .interval_seconds(60i64)
        .build();
    h.persisted.create(draft).await.unwrap();
    h.persisted.claim("orphan", "sched-OLD").await.unwrap();

    h.service.start().await.unwrap();

    let task = h.service.get_task("orphan").await.unwrap();
    assert_eq!(task.status, TaskStatus::Idle);
    assert!(task.run_started_at.is_none());
    assert!(task.process_instance_id.is_none());

    h.service.stop().await;
}

#[tokio::test]
async fn stuck_tasks_are_reset_during_polling() {
    let h = build_with_config(
        SchedulerConfig {
            stuck_task_timeout_ms: 1_000,
            ..Default::default()
        },
        InstanceId::generate(),
    );

    let draft = TaskDraft::builder()
        .name("wedged")
        .task_type("counting")
        .schedule_type(TaskScheduleType::Interval)
        .interval_seconds(60i64)
        .build();
    h.persisted.create(draft).await.unwrap();
    h.persisted.claim("wedged", "sched-self").await.unwrap();

    // Backdate the run start past the stuck threshold.
    let mut task = h.persisted.get_by_name("wedged").await.unwrap().unwrap();
    task.run_started_at = Some(Utc::now() - Duration::seconds(5));
    h.persisted.seed(task);

    h.service.tick().await;

    let task = h.service.get_task("wedged").await.unwrap();
    assert_eq!(task.status, TaskStatus::Idle);
    assert!(task.run_started_at.is_none());
}

#[tokio::test]
async fn stop_cancels_running_handlers() {
    let h = build();
    h.registry
        .register_fn("patient", |_task, cancel| async move {
            cancel.cancelled().await;
            Ok(TaskRunResult::failure("cancelled"))
        })
        .unwrap();

    h.service
        .register_task(
            TaskDraft::builder()
                .name("long-runner")
                .task_type("patient")
                .schedule_type(TaskScheduleType::OneOff)
                .scheduled_at(Utc::now() - Duration::milliseconds(10))
                .build(),
        )
        .await
        .unwrap();

    h.service.start().await.unwrap();
    wait_for_task(&h.service, "long-runner", 3_000, |t| {
        t.status == TaskStatus::Running
    })
    .await;

    // stop() cancels the handler's token and waits for the drain.
    h.service.stop().await;
    assert!(h.service.running_tasks().await.is_empty());

    let task = h.service.get_task("long-runner").await.unwrap();
    assert_ne!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn polling_loop_fires_due_tasks() {
    let h = build();
    let calls = counting_handler(&h.registry, "counting");
    h.service
        .register_task(due_interval_task("polled", 60))
        .await
        .unwrap();

    h.service.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    while calls.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    h.service.stop().await;
}
