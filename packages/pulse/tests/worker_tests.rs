//! Worker pool behavior: dispatch order, graceful shutdown, budgets.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use pulse::testing::{job, memory_store};
use pulse::{
    BudgetLedger, HandlerFailure, HandlerOutcome, HandlerRegistry, JobQueue, JobStatus,
    WorkerPool, WorkerPoolConfig,
};

fn pool_config(boot: &str) -> WorkerPoolConfig {
    WorkerPoolConfig {
        workers: 1,
        poll_interval: Duration::from_millis(20),
        boot_id: boot.to_string(),
    }
}

fn unbounded_budget(pool: &sqlx::SqlitePool) -> Arc<BudgetLedger> {
    Arc::new(BudgetLedger::new(pool.clone(), None, None))
}

/// Poll until `f` holds or a few seconds pass.
async fn wait_until<F, Fut>(mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if f().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

async fn drain(handles: Vec<tokio::task::JoinHandle<()>>) {
    tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(handles))
        .await
        .expect("workers drained within deadline");
}

#[tokio::test]
async fn single_worker_completes_jobs_in_fifo_order() {
    let store = memory_store().await;
    let queue = JobQueue::new(store.pool().clone(), 3);

    let completed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let record = completed.clone();

    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", move |_cancel, job, _progress| {
        let record = record.clone();
        async move {
            record.lock().unwrap().push(job.id.clone());
            Ok(HandlerOutcome::with_cost(0.0))
        }
    });

    let base = Utc::now();
    let mut ids = Vec::new();
    for i in 0..3 {
        let mut j = job("echo", b"{}");
        j.created_at = base + chrono::Duration::seconds(i);
        queue.enqueue(&j).await.unwrap();
        ids.push(j.id);
    }

    let shutdown = CancellationToken::new();
    let handles = WorkerPool::new(
        queue.clone(),
        Arc::new(registry),
        unbounded_budget(store.pool()),
        pool_config("boot-fifo"),
    )
    .spawn(shutdown.clone());

    let q = queue.clone();
    wait_until(|| {
        let q = q.clone();
        async move {
            q.list(Some(JobStatus::Completed), 10).await.unwrap().len() == 3
        }
    })
    .await;

    shutdown.cancel();
    drain(handles).await;

    assert_eq!(*completed.lock().unwrap(), ids);
}

#[tokio::test]
async fn graceful_shutdown_checkpoints_and_requeues_in_flight_job() {
    let store = memory_store().await;
    let queue = JobQueue::new(store.pool().clone(), 3);

    let mut registry = HandlerRegistry::new();
    registry.register_fn("slow", |cancel, _job, progress| async move {
        progress.report(5, 10, Some(b"cp-x")).await;
        // Hold until shutdown reaches us, then hand back a checkpoint.
        cancel.cancelled().await;
        Err(HandlerFailure::retryable("interrupted").with_checkpoint(b"cp-x".to_vec()))
    });

    let j = job("slow", b"{}");
    queue.enqueue(&j).await.unwrap();

    let shutdown = CancellationToken::new();
    let handles = WorkerPool::new(
        queue.clone(),
        Arc::new(registry),
        unbounded_budget(store.pool()),
        pool_config("boot-a"),
    )
    .spawn(shutdown.clone());

    let q = queue.clone();
    let id = j.id.clone();
    wait_until(|| {
        let q = q.clone();
        let id = id.clone();
        async move { q.get(&id).await.unwrap().progress_current == 5 }
    })
    .await;

    shutdown.cancel();
    drain(handles).await;

    let parked = queue.get(&j.id).await.unwrap();
    assert_eq!(parked.status, JobStatus::Queued);
    assert_eq!(parked.progress_current, 5);
    assert_eq!(parked.checkpoint.as_deref(), Some(&b"cp-x"[..]));
    assert_eq!(parked.attempts, 1);

    // On the next boot the same handler name resumes from the checkpoint.
    let received: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let sink = received.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("slow", move |_cancel, job, _progress| {
        let sink = sink.clone();
        async move {
            *sink.lock().unwrap() = job.checkpoint.clone();
            Ok(HandlerOutcome::with_cost(0.1))
        }
    });

    let shutdown = CancellationToken::new();
    let handles = WorkerPool::new(
        queue.clone(),
        Arc::new(registry),
        unbounded_budget(store.pool()),
        pool_config("boot-b"),
    )
    .spawn(shutdown.clone());

    let q = queue.clone();
    let id = j.id.clone();
    wait_until(|| {
        let q = q.clone();
        let id = id.clone();
        async move { q.get(&id).await.unwrap().status == JobStatus::Completed }
    })
    .await;

    shutdown.cancel();
    drain(handles).await;

    assert_eq!(received.lock().unwrap().as_deref(), Some(&b"cp-x"[..]));
}

#[tokio::test]
async fn budget_rejection_leaves_job_queued_without_attempts() {
    let store = memory_store().await;
    let queue = JobQueue::new(store.pool().clone(), 3);

    // 0.90 already spent today.
    let prior = job("echo", b"{}");
    queue.enqueue(&prior).await.unwrap();
    let leased = queue.lease("setup", "boot-setup").await.unwrap().unwrap();
    queue.complete(&leased.id, 0.9).await.unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", |_cancel, _job, _progress| async move {
        Ok(HandlerOutcome::with_cost(0.2))
    });

    let mut over = job("echo", b"{}");
    over.cost_estimate = 0.2;
    queue.enqueue(&over).await.unwrap();

    let budget = Arc::new(BudgetLedger::new(store.pool().clone(), Some(1.0), None));
    let shutdown = CancellationToken::new();
    let handles = WorkerPool::new(
        queue.clone(),
        Arc::new(registry),
        budget,
        pool_config("boot-budget"),
    )
    .spawn(shutdown.clone());

    let q = queue.clone();
    let id = over.id.clone();
    wait_until(|| {
        let q = q.clone();
        let id = id.clone();
        async move { q.get(&id).await.unwrap().last_error.is_some() }
    })
    .await;

    shutdown.cancel();
    drain(handles).await;

    let deferred = queue.get(&over.id).await.unwrap();
    assert_eq!(deferred.status, JobStatus::Queued);
    assert_eq!(deferred.attempts, 0);
    assert!(deferred
        .last_error
        .as_deref()
        .unwrap()
        .contains("budget rejected"));
}

#[tokio::test]
async fn missing_handler_fails_terminally() {
    let store = memory_store().await;
    let queue = JobQueue::new(store.pool().clone(), 3);

    let j = job("nobody-home", b"{}");
    queue.enqueue(&j).await.unwrap();

    let shutdown = CancellationToken::new();
    let handles = WorkerPool::new(
        queue.clone(),
        Arc::new(HandlerRegistry::new()),
        unbounded_budget(store.pool()),
        pool_config("boot-missing"),
    )
    .spawn(shutdown.clone());

    let q = queue.clone();
    let id = j.id.clone();
    wait_until(|| {
        let q = q.clone();
        let id = id.clone();
        async move { q.get(&id).await.unwrap().status == JobStatus::Failed }
    })
    .await;

    shutdown.cancel();
    drain(handles).await;

    let failed = queue.get(&j.id).await.unwrap();
    assert_eq!(failed.last_error.as_deref(), Some("no handler registered"));
    assert_eq!(failed.attempts, 1);
}

#[tokio::test]
async fn pause_mid_run_parks_job_with_checkpoint_until_resumed() {
    let store = memory_store().await;
    let queue = JobQueue::new(store.pool().clone(), 3);

    let resumed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let parked = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let resumed_flag = resumed.clone();
    let parked_flag = parked.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("steady", move |_cancel, _job, progress| {
        let resumed = resumed_flag.clone();
        let parked = parked_flag.clone();
        async move {
            if resumed.load(std::sync::atomic::Ordering::SeqCst) {
                return Ok(HandlerOutcome::with_cost(0.0));
            }
            let mut step = 0;
            loop {
                step += 1;
                if progress.report(step, 100, Some(b"cp-pause")).await {
                    parked.store(true, std::sync::atomic::Ordering::SeqCst);
                    return Err(HandlerFailure::retryable("interrupted")
                        .with_checkpoint(b"cp-pause".to_vec()));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    });

    let j = job("steady", b"{}");
    queue.enqueue(&j).await.unwrap();

    let shutdown = CancellationToken::new();
    let handles = WorkerPool::new(
        queue.clone(),
        Arc::new(registry),
        unbounded_budget(store.pool()),
        pool_config("boot-pause"),
    )
    .spawn(shutdown.clone());

    let q = queue.clone();
    let id = j.id.clone();
    wait_until(|| {
        let q = q.clone();
        let id = id.clone();
        async move { q.get(&id).await.unwrap().progress_current >= 1 }
    })
    .await;

    queue.pause(&j.id).await.unwrap();

    // The handler notices at its next report and parks the job.
    let q = queue.clone();
    let id = j.id.clone();
    let handler_done = parked.clone();
    wait_until(move || {
        let q = q.clone();
        let id = id.clone();
        let handler_done = handler_done.clone();
        async move {
            let job = q.get(&id).await.unwrap();
            handler_done.load(std::sync::atomic::Ordering::SeqCst)
                && job.status == JobStatus::Paused
                && job.checkpoint.as_deref() == Some(&b"cp-pause"[..])
        }
    })
    .await;

    // Resume: the job requeues and the handler finishes this time.
    resumed.store(true, std::sync::atomic::Ordering::SeqCst);
    queue.resume(&j.id).await.unwrap();

    let q = queue.clone();
    let id = j.id.clone();
    wait_until(|| {
        let q = q.clone();
        let id = id.clone();
        async move { q.get(&id).await.unwrap().status == JobStatus::Completed }
    })
    .await;

    shutdown.cancel();
    drain(handles).await;
}

#[tokio::test]
async fn retryable_handler_failure_is_retried_to_exhaustion() {
    let store = memory_store().await;
    let queue = JobQueue::new(store.pool().clone(), 2);

    let mut registry = HandlerRegistry::new();
    registry.register_fn("flaky", |_cancel, _job, _progress| async move {
        Err(HandlerFailure::retryable("upstream timeout"))
    });

    let j = job("flaky", b"{}");
    queue.enqueue(&j).await.unwrap();

    let shutdown = CancellationToken::new();
    let handles = WorkerPool::new(
        queue.clone(),
        Arc::new(registry),
        unbounded_budget(store.pool()),
        pool_config("boot-flaky"),
    )
    .spawn(shutdown.clone());

    let q = queue.clone();
    let id = j.id.clone();
    wait_until(|| {
        let q = q.clone();
        let id = id.clone();
        async move { q.get(&id).await.unwrap().status == JobStatus::Failed }
    })
    .await;

    shutdown.cancel();
    drain(handles).await;

    let failed = queue.get(&j.id).await.unwrap();
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.last_error.as_deref(), Some("upstream timeout"));
}
