use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use loom_core::config::ManagerConfig;
use loom_core::domain::{FailureKind, TaskStatus};
use loom_core::impls::{InMemoryQueueClient, QueueDispatcher, RecordingSink};
use loom_core::ports::{Delivery, DispatchError, Engine, ResultDispatcher};
use loom_core::{
    Cancellation, DualLogger, EngineError, FnEngine, SubmitOptions, TaskError, TaskManager,
    TaskManagerBuilder, TaskMode,
};

fn config(workers: usize, capacity: usize) -> ManagerConfig {
    ManagerConfig {
        engine_workers: workers,
        queue_capacity: capacity,
        ..ManagerConfig::default()
    }
}

fn build(config: ManagerConfig, engine: Arc<dyn Engine>) -> TaskManager {
    TaskManagerBuilder::new(config).engine(engine).build().unwrap()
}

/// Sleeps `delay`, records the payload, echoes it back.
fn recording_engine(delay: Duration, calls: Arc<Mutex<Vec<Value>>>) -> Arc<dyn Engine> {
    FnEngine::arc(move |payload: Arc<Value>| {
        let calls = Arc::clone(&calls);
        async move {
            calls.lock().unwrap().push(payload.as_ref().clone());
            tokio::time::sleep(delay).await;
            Ok(payload.as_ref().clone())
        }
    })
}

fn sleeping_engine(delay: Duration) -> Arc<dyn Engine> {
    recording_engine(delay, Arc::new(Mutex::new(Vec::new())))
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

fn status(m: &TaskManager, id: loom_core::TaskId) -> TaskStatus {
    m.get_status(id).unwrap().status
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_until_a_slot_frees() {
    let m = build(config(1, 2), sleeping_engine(Duration::from_millis(100)));
    m.start().unwrap();

    let a = m.submit(json!("A"), TaskMode::Sync, None).unwrap();
    let b = m.submit(json!("B"), TaskMode::Sync, None).unwrap();
    let c = m.submit(json!("C"), TaskMode::Sync, None);
    assert_eq!(c, Err(TaskError::QueueFull { capacity: 2 }));
    assert_eq!(m.stats().total_tasks, 2);

    assert_eq!(m.await_result(a, Duration::from_secs(1)).await, Ok(json!("A")));

    let c = m.submit(json!("C"), TaskMode::Sync, None).unwrap();
    assert_eq!(m.await_result(b, Duration::from_secs(1)).await, Ok(json!("B")));
    assert_eq!(m.await_result(c, Duration::from_secs(1)).await, Ok(json!("C")));
    assert_eq!(m.stats().total_tasks, 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_end_failed_after_max_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = FnEngine::arc({
        let calls = Arc::clone(&calls);
        move |_payload: Arc<Value>| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<Value, _>(EngineError::new(format!("attempt {n} failed")))
            }
        }
    });
    let m = build(
        ManagerConfig {
            max_attempts: 2,
            ..config(1, 4)
        },
        engine,
    );
    m.start().unwrap();

    let id = m.submit(json!({}), TaskMode::Sync, None).unwrap();
    let err = m.await_result(id, Duration::from_secs(1)).await.unwrap_err();

    assert_eq!(err, TaskError::EngineExecution("attempt 2 failed".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snap = m.get_status(id).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert_eq!(snap.attempt, 2);
    assert!(!snap.error.unwrap().message.is_empty());
}

#[tokio::test(start_paused = true)]
async fn retried_task_goes_to_the_back_of_the_queue() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let failed_once = Arc::new(AtomicUsize::new(0));
    let engine = FnEngine::arc({
        let order = Arc::clone(&order);
        let failed_once = Arc::clone(&failed_once);
        move |payload: Arc<Value>| {
            let order = Arc::clone(&order);
            let failed_once = Arc::clone(&failed_once);
            async move {
                order.lock().unwrap().push(payload.as_ref().clone());
                if *payload == json!("A") && failed_once.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(EngineError::from("flaky"));
                }
                Ok(payload.as_ref().clone())
            }
        }
    });
    let m = build(
        ManagerConfig {
            max_attempts: 2,
            ..config(1, 4)
        },
        engine,
    );

    // queued before start, drained once workers exist
    let a = m.submit(json!("A"), TaskMode::Sync, None).unwrap();
    let b = m.submit(json!("B"), TaskMode::Sync, None).unwrap();
    m.start().unwrap();

    assert_eq!(m.await_result(a, Duration::from_secs(1)).await, Ok(json!("A")));
    assert_eq!(m.await_result(b, Duration::from_secs(1)).await, Ok(json!("B")));
    assert_eq!(*order.lock().unwrap(), vec![json!("A"), json!("B"), json!("A")]);
    assert_eq!(m.get_status(a).unwrap().attempt, 2);
}

#[tokio::test(start_paused = true)]
async fn await_deadline_does_not_touch_the_task() {
    let m = build(config(1, 4), sleeping_engine(Duration::from_millis(200)));
    m.start().unwrap();

    let id = m.submit(json!("slow"), TaskMode::Sync, None).unwrap();
    let err = m
        .await_result(id, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        TaskError::AwaitTimeout {
            task_id: id,
            waited: Duration::from_millis(50)
        }
    );
    assert_eq!(status(&m, id), TaskStatus::Running);

    wait_until(|| status(&m, id) == TaskStatus::Succeeded).await;
    // still collectable after the earlier timeout
    assert_eq!(m.await_result(id, Duration::ZERO).await, Ok(json!("slow")));
}

#[tokio::test(start_paused = true)]
async fn cancelling_pending_task_never_reaches_the_engine() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let m = build(
        config(1, 4),
        recording_engine(Duration::from_millis(100), Arc::clone(&calls)),
    );
    m.start().unwrap();

    let a = m.submit(json!("A"), TaskMode::Sync, None).unwrap();
    wait_until(|| status(&m, a) == TaskStatus::Running).await;
    let b = m.submit(json!("B"), TaskMode::Sync, None).unwrap();
    assert_eq!(m.stats().queue_size, 1);

    assert_eq!(m.cancel(b), Ok(Cancellation::Dequeued));
    assert_eq!(m.stats().queue_size, 0);
    assert_eq!(
        m.await_result(b, Duration::from_secs(1)).await,
        Err(TaskError::Cancelled(b))
    );

    m.await_result(a, Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*calls.lock().unwrap(), vec![json!("A")]);

    let snap = m.get_status(b).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert_eq!(snap.error.unwrap().kind, FailureKind::Cancelled);
    assert!(snap.started_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelling_running_task_only_marks_it() {
    let m = build(config(1, 4), sleeping_engine(Duration::from_millis(100)));
    m.start().unwrap();

    let id = m.submit(json!("A"), TaskMode::Sync, None).unwrap();
    wait_until(|| status(&m, id) == TaskStatus::Running).await;

    assert_eq!(m.cancel(id), Ok(Cancellation::MarkedOnly));
    assert_eq!(
        m.cancel(id),
        Err(TaskError::AlreadyFinished {
            task_id: id,
            status: TaskStatus::Failed
        })
    );

    // the engine's late result is discarded
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snap = m.get_status(id).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.result.is_none());
    assert_eq!(m.stats().active_workers, 0);
}

#[tokio::test(start_paused = true)]
async fn execution_timeout_is_terminal_and_never_retried() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let m = build(
        ManagerConfig {
            max_attempts: 3,
            ..config(1, 4)
        },
        recording_engine(Duration::from_secs(5), Arc::clone(&calls)),
    );
    m.start().unwrap();

    let id = m
        .submit(json!("slow"), TaskMode::Sync, Some(Duration::from_millis(100)))
        .unwrap();
    let err = m.await_result(id, Duration::from_secs(1)).await.unwrap_err();

    assert_eq!(
        err,
        TaskError::TimeoutExpired("execution exceeded 100ms".to_string())
    );
    let snap = m.get_status(id).unwrap();
    assert_eq!(snap.status, TaskStatus::TimedOut);
    assert_eq!(snap.error.unwrap().kind, FailureKind::Timeout);
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn one_queue_in_fifo_order_for_both_modes() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let m = build(
        config(1, 8),
        recording_engine(Duration::from_millis(1), Arc::clone(&calls)),
    );

    let mut ids = Vec::new();
    for i in 0..6 {
        let mode = if i % 2 == 0 {
            TaskMode::Sync
        } else {
            TaskMode::Async
        };
        ids.push(m.submit(json!(i), mode, None).unwrap());
    }
    m.start().unwrap();

    wait_until(|| m.status_counts().succeeded == 6).await;
    let expected: Vec<Value> = (0..6).map(|i| json!(i)).collect();
    assert_eq!(*calls.lock().unwrap(), expected);
}

#[tokio::test(start_paused = true)]
async fn await_rejects_async_and_unknown_tasks() {
    let m = build(config(1, 4), sleeping_engine(Duration::from_millis(1)));
    let id = m.submit(json!(1), TaskMode::Async, None).unwrap();

    assert_eq!(
        m.await_result(id, Duration::from_millis(10)).await,
        Err(TaskError::NotAwaitable(id))
    );

    let unknown: loom_core::TaskId = "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap();
    assert_eq!(m.get_status(unknown), Err(TaskError::NotFound(unknown)));
    assert_eq!(m.cancel(unknown), Err(TaskError::NotFound(unknown)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_see_consistent_snapshots() {
    let m = Arc::new(build(config(3, 64), sleeping_engine(Duration::from_millis(2))));
    m.start().unwrap();

    let ids: Vec<_> = (0..40)
        .map(|i| m.submit(json!(i), TaskMode::Sync, None).unwrap())
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let m = Arc::clone(&m);
            let ids = ids.clone();
            tokio::spawn(async move {
                loop {
                    let mut done = 0;
                    for id in &ids {
                        let snap = m.get_status(*id).unwrap();
                        assert_eq!(snap.status.is_terminal(), snap.finished_at.is_some());
                        assert_eq!(snap.status == TaskStatus::Pending, snap.started_at.is_none());
                        assert_eq!(snap.status == TaskStatus::Succeeded, snap.result.is_some());
                        if snap.status.is_terminal() {
                            done += 1;
                        }
                    }
                    if done == ids.len() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for reader in readers {
        tokio::time::timeout(Duration::from_secs(10), reader)
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(m.status_counts().succeeded, 40);
}

#[tokio::test(start_paused = true)]
async fn transitions_are_logged_in_order_on_both_channels() {
    let service = Arc::new(RecordingSink::new());
    let debug = Arc::new(RecordingSink::new());
    let m = TaskManagerBuilder::new(config(2, 8))
        .engine(sleeping_engine(Duration::from_millis(5)))
        .logger(DualLogger::new(service.clone(), debug.clone()))
        .build()
        .unwrap();
    m.start().unwrap();

    let ids: Vec<_> = (0..4)
        .map(|i| m.submit(json!(i), TaskMode::Sync, None).unwrap())
        .collect();
    for id in &ids {
        m.await_result(*id, Duration::from_secs(1)).await.unwrap();
    }

    for id in ids {
        let transitions: Vec<_> = debug
            .events_for(id)
            .into_iter()
            .filter(|e| e.message == "status transition")
            .collect();
        let pairs: Vec<(Value, Value)> = transitions
            .iter()
            .map(|e| {
                (
                    e.field("old_status").cloned().unwrap(),
                    e.field("new_status").cloned().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                (Value::Null, json!("PENDING")),
                (json!("PENDING"), json!("RUNNING")),
                (json!("RUNNING"), json!("SUCCEEDED")),
            ]
        );

        let lines: Vec<_> = service
            .events_for(id)
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(lines, vec!["task submitted", "task finished"]);
    }
}

#[tokio::test(start_paused = true)]
async fn async_results_are_delivered_exactly_once() {
    let client = Arc::new(InMemoryQueueClient::new());
    let engine = FnEngine::arc(|payload: Arc<Value>| async move {
        if *payload == json!("bad") {
            return Err(EngineError::from("cannot classify"));
        }
        Ok(json!({ "label": *payload }))
    });
    let m = TaskManagerBuilder::new(config(2, 8))
        .engine(engine)
        .dispatcher(Arc::new(QueueDispatcher::new(client.clone(), "task_status")))
        .build()
        .unwrap();
    m.start().unwrap();

    let ok = m.submit(json!("cat"), TaskMode::Async, None).unwrap();
    let bad = m.submit(json!("bad"), TaskMode::Async, None).unwrap();
    let sync = m.submit(json!("dog"), TaskMode::Sync, None).unwrap();
    m.await_result(sync, Duration::from_secs(1)).await.unwrap();

    let mut delivered = Vec::new();
    for _ in 0..2 {
        let msg = tokio::time::timeout(Duration::from_secs(1), client.recv())
            .await
            .unwrap();
        assert_eq!(msg.topic, "task_status");
        delivered.push(msg.body);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.is_empty(), "sync tasks and repeats are never delivered");

    let by_id = |id: loom_core::TaskId| {
        delivered
            .iter()
            .find(|b| b["task_id"] == json!(id.as_ulid().to_string()))
            .cloned()
            .unwrap()
    };
    assert_eq!(by_id(ok)["status"], "SUCCEEDED");
    assert_eq!(by_id(ok)["result"]["label"], "cat");
    assert_eq!(by_id(bad)["status"], "FAILED");
    assert_eq!(by_id(bad)["error"]["message"], "cannot classify");
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_queued_and_overdue_tasks() {
    let m = build(config(1, 4), sleeping_engine(Duration::from_secs(10)));
    m.start().unwrap();

    let running = m.submit(json!("A"), TaskMode::Sync, None).unwrap();
    wait_until(|| status(&m, running) == TaskStatus::Running).await;
    let queued = m.submit(json!("B"), TaskMode::Async, None).unwrap();

    m.shutdown_with(Duration::from_millis(50)).await;

    for id in [running, queued] {
        let snap = m.get_status(id).unwrap();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert_eq!(snap.error.unwrap().kind, FailureKind::Shutdown);
    }
    assert_eq!(
        m.submit(json!("C"), TaskMode::Sync, None),
        Err(TaskError::ShuttingDown)
    );
    assert_eq!(m.start(), Err(TaskError::ShuttingDown));
    let stats = m.stats();
    assert!(!stats.is_started);
    assert_eq!(stats.queue_size, 0);
    assert_eq!(stats.active_workers, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_in_flight_work_finish_within_grace() {
    let m = build(config(1, 4), sleeping_engine(Duration::from_millis(20)));
    m.start().unwrap();

    let id = m.submit(json!("A"), TaskMode::Sync, None).unwrap();
    wait_until(|| status(&m, id) == TaskStatus::Running).await;

    m.shutdown_with(Duration::from_secs(1)).await;
    assert_eq!(status(&m, id), TaskStatus::Succeeded);
    // a second call is a no-op
    m.shutdown().await;
}

/// Decrements the in-flight counter when the engine future goes away.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_engines_never_exceed_worker_count() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let engine = FnEngine::arc({
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        move |_payload: Arc<Value>| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let _in_flight = InFlight(current);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("late"))
            }
        }
    });
    let m = build(config(1, 8), engine);
    m.start().unwrap();

    for i in 0..5 {
        m.submit(json!(i), TaskMode::Async, Some(Duration::from_millis(100)))
            .unwrap();
    }
    wait_until(|| m.status_counts().timed_out == 5).await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(current.load(Ordering::SeqCst), 0);
    assert_eq!(m.stats().active_workers, 0);
}

struct FailingDispatcher {
    calls: AtomicUsize,
}

#[async_trait]
impl ResultDispatcher for FailingDispatcher {
    async fn deliver(&self, _delivery: Delivery) -> Result<(), DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DispatchError::Transport("broker unreachable".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_is_logged_once_and_leaves_the_task_finished() {
    let dispatcher = Arc::new(FailingDispatcher {
        calls: AtomicUsize::new(0),
    });
    let service = Arc::new(RecordingSink::new());
    let m = TaskManagerBuilder::new(config(1, 4))
        .engine(sleeping_engine(Duration::from_millis(5)))
        .logger(DualLogger::new(service.clone(), Arc::new(RecordingSink::new())))
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();
    m.start().unwrap();

    let id = m.submit(json!("cat"), TaskMode::Async, None).unwrap();
    let delivery_failures = || {
        service
            .events_for(id)
            .into_iter()
            .filter(|e| e.message == "result delivery failed")
            .count()
    };
    wait_until(|| delivery_failures() > 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(delivery_failures(), 1);
    let event = service
        .events_for(id)
        .into_iter()
        .find(|e| e.message == "result delivery failed")
        .unwrap();
    assert_eq!(
        event.field("error"),
        Some(&json!("transport error: broker unreachable"))
    );
    assert_eq!(status(&m, id), TaskStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn callback_url_travels_with_the_async_result() {
    let client = Arc::new(InMemoryQueueClient::new());
    let m = TaskManagerBuilder::new(config(1, 4))
        .engine(sleeping_engine(Duration::from_millis(5)))
        .dispatcher(Arc::new(QueueDispatcher::new(client.clone(), "task_status")))
        .build()
        .unwrap();
    m.start().unwrap();

    let with = m
        .submit_with(
            json!("A"),
            TaskMode::Async,
            SubmitOptions::default().callback_url("https://caller.example/done"),
        )
        .unwrap();
    let without = m.submit(json!("B"), TaskMode::Async, None).unwrap();

    let mut bodies = Vec::new();
    for _ in 0..2 {
        let msg = tokio::time::timeout(Duration::from_secs(1), client.recv())
            .await
            .unwrap();
        bodies.push(msg.body);
    }
    let body_of = |id: loom_core::TaskId| {
        bodies
            .iter()
            .find(|b| b["task_id"] == json!(id.as_ulid().to_string()))
            .cloned()
            .unwrap()
    };
    assert_eq!(body_of(with)["callback_url"], "https://caller.example/done");
    assert!(body_of(without).get("callback_url").is_none());
    assert_eq!(
        m.get_status(with).unwrap().callback_url.as_deref(),
        Some("https://caller.example/done")
    );
}

#[tokio::test(start_paused = true)]
async fn retry_refused_by_a_full_queue_ends_failed() {
    let engine = FnEngine::arc(|payload: Arc<Value>| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if *payload == json!("A") {
            return Err(EngineError::from("A failed"));
        }
        Ok(payload.as_ref().clone())
    });
    let m = build(
        ManagerConfig {
            max_attempts: 3,
            ..config(1, 1)
        },
        engine,
    );
    m.start().unwrap();

    let a = m.submit(json!("A"), TaskMode::Sync, None).unwrap();
    wait_until(|| status(&m, a) == TaskStatus::Running).await;
    // B takes the only slot, so A's retry has nowhere to go
    let b = m.submit(json!("B"), TaskMode::Sync, None).unwrap();

    let err = m.await_result(a, Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err, TaskError::EngineExecution("A failed".to_string()));
    let snap = m.get_status(a).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert_eq!(snap.attempt, 1);
    assert_eq!(snap.max_attempts, 3);

    assert_eq!(m.await_result(b, Duration::from_secs(1)).await, Ok(json!("B")));
}
