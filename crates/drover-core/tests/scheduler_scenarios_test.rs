//! End-to-end scheduler scenarios against the in-memory store: assignment,
//! priority ordering, resource admission, orphan recovery, the timeout
//! race, and cancellation.
//!
//! Every pass takes an explicit `now`, so the clock is advanced by passing
//! later timestamps rather than by sleeping.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use drover_core::engine::AssignmentEngine;
use drover_core::ledger::{Committed, GIB, ResourceLedger};
use drover_core::liveness::{LivenessMonitor, ORPHAN_EXHAUSTED_ERROR};
use drover_core::metrics::{MetricsSink, NullSink};
use drover_core::scheduler::SchedulerConfig;
use drover_core::service::{
    CancelError, RegisterWorker, ReportedOutcome, SubmitTask, WorkerReport, cancel_task,
    register_worker, report_status, submit_task,
};
use drover_core::store::{MemoryStore, TaskStore};
use drover_core::sweeper::{TIMEOUT_ERROR, TimeoutSweeper};

use drover_db::models::{Task, TaskPriority, TaskStatus, Worker, WorkerStatus};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    ledger: Arc<ResourceLedger>,
    metrics: Arc<dyn MetricsSink>,
    engine: AssignmentEngine,
    liveness: LivenessMonitor,
    sweeper: TimeoutSweeper,
    config: SchedulerConfig,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn TaskStore> = store.clone();
        let ledger = Arc::new(ResourceLedger::new());
        let metrics: Arc<dyn MetricsSink> = Arc::new(NullSink);
        let config = SchedulerConfig::default();
        let engine = AssignmentEngine::new(
            store_dyn.clone(),
            ledger.clone(),
            metrics.clone(),
            config.clone(),
        );
        let liveness = LivenessMonitor::new(
            store_dyn.clone(),
            ledger.clone(),
            metrics.clone(),
            config.clone(),
        );
        let sweeper = TimeoutSweeper::new(
            store_dyn,
            ledger.clone(),
            metrics.clone(),
            config.clone(),
        );
        Self {
            store,
            ledger,
            metrics,
            engine,
            liveness,
            sweeper,
            config,
        }
    }

    async fn submit(&self, req: SubmitTask, now: DateTime<Utc>) -> Task {
        submit_task(
            self.store.as_ref(),
            self.metrics.as_ref(),
            self.config.task_timeout,
            req,
            now,
        )
        .await
        .expect("submit should succeed")
    }

    async fn register(&self, req: RegisterWorker, now: DateTime<Utc>) -> Worker {
        register_worker(self.store.as_ref(), req, now)
            .await
            .expect("register should succeed")
    }

    async fn report(&self, worker_id: Uuid, report: WorkerReport, now: DateTime<Utc>) -> Worker {
        report_status(
            self.store.as_ref(),
            self.ledger.as_ref(),
            self.metrics.as_ref(),
            worker_id,
            report,
            now,
        )
        .await
        .expect("report should succeed")
    }

    async fn task(&self, id: Uuid) -> Task {
        self.store.get_task(id).await.expect("task should exist")
    }

    async fn worker(&self, id: Uuid) -> Worker {
        self.store
            .get_worker(id)
            .await
            .expect("worker should exist")
    }
}

fn submit_req(name: &str, model: &str, priority: TaskPriority) -> SubmitTask {
    SubmitTask {
        name: name.to_owned(),
        description: String::new(),
        model_name: model.to_owned(),
        priority,
        input: Vec::new(),
        user_id: "tester".to_owned(),
        timeout_seconds: None,
        max_retries: None,
    }
}

fn register_req(name: &str, capabilities: &[&str], cpu: f64, memory: i64, gpu: f64) -> RegisterWorker {
    RegisterWorker {
        id: None,
        name: name.to_owned(),
        capabilities: capabilities.iter().map(|c| (*c).to_owned()).collect(),
        available_cpu: cpu,
        available_memory: memory,
        available_gpu: gpu,
    }
}

fn report_req(status: WorkerStatus, task_id: Uuid, outcome: ReportedOutcome) -> WorkerReport {
    WorkerReport {
        status,
        current_task_id: Some(task_id),
        task_status: Some(outcome),
        task_output: None,
        task_error: None,
        available_cpu: 2.0,
        available_memory: 4 * GIB,
        available_gpu: 1.0,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_assign_run_complete() {
    let h = Harness::new();
    let t0 = Utc::now();

    let task = h
        .submit(submit_req("infer", "m", TaskPriority::Normal), t0)
        .await;
    let worker = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;

    let assigned = h.engine.run_once(t0).await.expect("pass should succeed");
    assert_eq!(assigned, 1);

    let scheduled = h.task(task.id).await;
    assert_eq!(scheduled.status, TaskStatus::Scheduled);
    assert_eq!(scheduled.worker_id, Some(worker.id));
    let busy = h.worker(worker.id).await;
    assert_eq!(busy.status, WorkerStatus::Busy);
    assert_eq!(busy.current_task_id, Some(task.id));

    let committed = h.ledger.snapshot(worker.id);
    assert_eq!(committed.cpu_cores, 1.0);
    assert_eq!(committed.memory_bytes, 2 * GIB);
    assert!((committed.gpu_fraction - 0.7).abs() < 1e-6);

    // Worker reports running, then completed with output.
    let t1 = t0 + Duration::seconds(1);
    h.report(
        worker.id,
        report_req(WorkerStatus::Busy, task.id, ReportedOutcome::Running),
        t1,
    )
    .await;
    let running = h.task(task.id).await;
    assert_eq!(running.status, TaskStatus::Running);
    assert_eq!(running.started_at, Some(t1));

    let t2 = t0 + Duration::seconds(5);
    let mut done = report_req(WorkerStatus::Available, task.id, ReportedOutcome::Completed);
    done.task_output = Some(b"ok".to_vec());
    h.report(worker.id, done, t2).await;

    let completed = h.task(task.id).await;
    assert_eq!(completed.status, TaskStatus::Completed);
    assert_eq!(completed.output.as_deref(), Some(b"ok".as_slice()));
    assert_eq!(completed.completed_at, Some(t2));

    let freed = h.worker(worker.id).await;
    assert_eq!(freed.status, WorkerStatus::Available);
    assert_eq!(freed.current_task_id, None);
    assert_eq!(freed.total_tasks_handled, 1);
    assert_eq!(h.ledger.snapshot(worker.id), Committed::default());
}

#[tokio::test]
async fn priority_wins_then_age_breaks_ties() {
    let h = Harness::new();
    let t0 = Utc::now();

    let t1 = h
        .submit(submit_req("t1", "m", TaskPriority::Normal), t0)
        .await;
    let t2 = h
        .submit(
            submit_req("t2", "m", TaskPriority::High),
            t0 + Duration::seconds(1),
        )
        .await;
    let t3 = h
        .submit(
            submit_req("t3", "m", TaskPriority::Normal),
            t0 + Duration::seconds(2),
        )
        .await;
    let worker = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;

    // One worker: the high-priority task wins the first pass.
    let now = t0 + Duration::seconds(3);
    assert_eq!(h.engine.run_once(now).await.expect("pass"), 1);
    assert_eq!(h.task(t2.id).await.status, TaskStatus::Scheduled);
    assert_eq!(h.task(t1.id).await.status, TaskStatus::Pending);

    // Complete it; the older of the two normals goes next.
    h.report(
        worker.id,
        report_req(WorkerStatus::Available, t2.id, ReportedOutcome::Completed),
        now,
    )
    .await;
    assert_eq!(h.engine.run_once(now).await.expect("pass"), 1);
    assert_eq!(h.task(t1.id).await.status, TaskStatus::Scheduled);
    assert_eq!(h.task(t3.id).await.status, TaskStatus::Pending);

    h.report(
        worker.id,
        report_req(WorkerStatus::Available, t1.id, ReportedOutcome::Completed),
        now,
    )
    .await;
    assert_eq!(h.engine.run_once(now).await.expect("pass"), 1);
    assert_eq!(h.task(t3.id).await.status, TaskStatus::Scheduled);
}

#[tokio::test]
async fn admission_spreads_tasks_without_overcommit() {
    let h = Harness::new();
    let t0 = Utc::now();

    // Two tagged tasks, each needing a full core; W1 only fits one.
    let w1 = h.register(register_req("w1", &["m"], 1.0, 8 * GIB, 1.0), t0).await;
    let w2 = h.register(register_req("w2", &["m"], 4.0, 8 * GIB, 1.0), t0).await;
    let a = h.submit(submit_req("a", "m", TaskPriority::Normal), t0).await;
    let b = h.submit(submit_req("b", "m", TaskPriority::Normal), t0).await;

    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 2);

    let a = h.task(a.id).await;
    let b = h.task(b.id).await;
    assert_eq!(a.status, TaskStatus::Scheduled);
    assert_eq!(b.status, TaskStatus::Scheduled);
    assert_ne!(a.worker_id, b.worker_id, "one task per worker");

    for worker_id in [w1.id, w2.id] {
        let committed = h.ledger.snapshot(worker_id);
        assert!(committed.cpu_cores <= h.worker(worker_id).await.available_cpu);
    }
}

#[tokio::test]
async fn held_task_stays_pending_when_nothing_fits() {
    let h = Harness::new();
    let t0 = Utc::now();

    // A worker that lacks the capability, and one with no GPU headroom.
    h.register(register_req("wrong-model", &["other"], 4.0, 8 * GIB, 1.0), t0)
        .await;
    h.register(register_req("no-gpu", &["m"], 4.0, 8 * GIB, 0.2), t0)
        .await;
    let task = h.submit(submit_req("t", "m", TaskPriority::Critical), t0).await;

    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 0);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Pending);

    // Held, not failed: a later fitting worker picks it up.
    let w = h.register(register_req("fits", &["m"], 4.0, 8 * GIB, 1.0), t0).await;
    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 1);
    assert_eq!(h.task(task.id).await.worker_id, Some(w.id));
}

#[tokio::test]
async fn orphan_recovery_consumes_retry_budget() {
    let h = Harness::new();
    let t0 = Utc::now();
    let stale = h.config.stale_after() + Duration::seconds(1);

    let mut req = submit_req("t", "m", TaskPriority::Normal);
    req.max_retries = Some(2);
    let task = h.submit(req, t0).await;

    // First assignment orphans: worker goes silent.
    let w1 = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;
    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 1);

    let t1 = t0 + stale;
    assert_eq!(h.liveness.run_once(t1).await.expect("pass"), 1);

    let requeued = h.task(task.id).await;
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.worker_id, None);
    let offline = h.worker(w1.id).await;
    assert_eq!(offline.status, WorkerStatus::Offline);
    assert_eq!(offline.current_task_id, None);
    assert_eq!(h.ledger.snapshot(w1.id), Committed::default());

    // A fresh worker picks the task up; orphan again.
    let w2 = h.register(register_req("w2", &["m"], 2.0, 4 * GIB, 1.0), t1).await;
    assert_eq!(h.engine.run_once(t1).await.expect("pass"), 1);
    assert_eq!(h.task(task.id).await.worker_id, Some(w2.id));

    let t2 = t1 + stale;
    assert_eq!(h.liveness.run_once(t2).await.expect("pass"), 1);
    assert_eq!(h.task(task.id).await.retry_count, 2);

    // Third loss exhausts the budget: terminal failure.
    h.register(register_req("w3", &["m"], 2.0, 4 * GIB, 1.0), t2).await;
    assert_eq!(h.engine.run_once(t2).await.expect("pass"), 1);

    let t3 = t2 + stale;
    assert_eq!(h.liveness.run_once(t3).await.expect("pass"), 1);

    let failed = h.task(task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.retry_count, 2);
    assert_eq!(failed.error.as_deref(), Some(ORPHAN_EXHAUSTED_ERROR));
}

#[tokio::test]
async fn late_report_from_orphaned_worker_cannot_settle_reassigned_task() {
    let h = Harness::new();
    let t0 = Utc::now();
    let stale = h.config.stale_after() + Duration::seconds(1);

    let task = h.submit(submit_req("t", "m", TaskPriority::Normal), t0).await;

    // W1 claims the task, goes silent, and loses it to the orphan path.
    let w1 = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;
    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 1);
    let t1 = t0 + stale;
    assert_eq!(h.liveness.run_once(t1).await.expect("pass"), 1);

    // W2 picks the task up and starts running it.
    let w2 = h.register(register_req("w2", &["m"], 2.0, 4 * GIB, 1.0), t1).await;
    assert_eq!(h.engine.run_once(t1).await.expect("pass"), 1);
    h.report(
        w2.id,
        report_req(WorkerStatus::Busy, task.id, ReportedOutcome::Running),
        t1,
    )
    .await;

    // W1 finally answers with a completed report for the task it lost:
    // acknowledged, but it must not touch the task or W2.
    let mut late = report_req(WorkerStatus::Available, task.id, ReportedOutcome::Completed);
    late.task_output = Some(b"stale result".to_vec());
    h.report(w1.id, late, t1 + Duration::seconds(1)).await;

    let still_running = h.task(task.id).await;
    assert_eq!(still_running.status, TaskStatus::Running);
    assert_eq!(still_running.worker_id, Some(w2.id));
    assert_eq!(still_running.output, None);
    let owner = h.worker(w2.id).await;
    assert_eq!(owner.status, WorkerStatus::Busy);
    assert_eq!(owner.current_task_id, Some(task.id));
    let committed = h.ledger.snapshot(w2.id);
    assert_eq!(committed.cpu_cores, 1.0);
    assert_eq!(committed.memory_bytes, 2 * GIB);

    // W2's own report still settles the task normally.
    let mut done = report_req(WorkerStatus::Available, task.id, ReportedOutcome::Completed);
    done.task_output = Some(b"real result".to_vec());
    h.report(w2.id, done, t1 + Duration::seconds(2)).await;

    let completed = h.task(task.id).await;
    assert_eq!(completed.status, TaskStatus::Completed);
    assert_eq!(completed.output.as_deref(), Some(b"real result".as_slice()));
    let freed = h.worker(w2.id).await;
    assert_eq!(freed.status, WorkerStatus::Available);
    assert_eq!(freed.current_task_id, None);
    assert_eq!(freed.total_tasks_handled, 1);
    assert_eq!(h.ledger.snapshot(w2.id), Committed::default());
}

#[tokio::test]
async fn liveness_pass_is_idempotent_and_respects_fresh_heartbeats() {
    let h = Harness::new();
    let t0 = Utc::now();

    let worker = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;

    // Within the heartbeat window: nothing is stale.
    let early = t0 + Duration::seconds(30);
    assert_eq!(h.liveness.run_once(early).await.expect("pass"), 0);
    assert_eq!(h.worker(worker.id).await.status, WorkerStatus::Available);

    // Past the window the worker expires; a second pass is a no-op.
    let late = t0 + h.config.stale_after() + Duration::seconds(1);
    assert_eq!(h.liveness.run_once(late).await.expect("pass"), 1);
    let after_first = h.worker(worker.id).await;
    assert_eq!(after_first.status, WorkerStatus::Offline);

    assert_eq!(h.liveness.run_once(late).await.expect("pass"), 0);
    let after_second = h.worker(worker.id).await;
    assert_eq!(after_second.status, WorkerStatus::Offline);
    assert_eq!(after_second.last_heartbeat, after_first.last_heartbeat);
}

#[tokio::test]
async fn timeout_race_drops_the_late_report() {
    let h = Harness::new();
    let t0 = Utc::now();

    let mut req = submit_req("slow", "m", TaskPriority::Normal);
    req.timeout_seconds = Some(60);
    let task = h.submit(req, t0).await;
    let worker = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;

    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 1);
    h.report(
        worker.id,
        report_req(WorkerStatus::Busy, task.id, ReportedOutcome::Running),
        t0,
    )
    .await;

    // The worker hangs; the sweeper fires at t+61.
    let t_sweep = t0 + Duration::seconds(61);
    assert_eq!(h.sweeper.run_once(t_sweep).await.expect("sweep"), 1);

    let timed_out = h.task(task.id).await;
    assert_eq!(timed_out.status, TaskStatus::Failed);
    assert_eq!(timed_out.error.as_deref(), Some(TIMEOUT_ERROR));
    let freed = h.worker(worker.id).await;
    assert_eq!(freed.status, WorkerStatus::Available);
    assert_eq!(freed.current_task_id, None);
    assert_eq!(h.ledger.snapshot(worker.id), Committed::default());

    // The worker finally answers at t+70: acknowledged, but dropped.
    let t_late = t0 + Duration::seconds(70);
    let mut late = report_req(WorkerStatus::Available, task.id, ReportedOutcome::Completed);
    late.task_output = Some(b"too late".to_vec());
    h.report(worker.id, late, t_late).await;

    let still_failed = h.task(task.id).await;
    assert_eq!(still_failed.status, TaskStatus::Failed);
    assert_eq!(still_failed.error.as_deref(), Some(TIMEOUT_ERROR));
    assert_eq!(still_failed.output, None);
    assert_eq!(h.worker(worker.id).await.total_tasks_handled, 0);
}

#[tokio::test]
async fn sweeper_honors_per_task_budget_and_ceiling() {
    let h = Harness::new();
    let t0 = Utc::now();

    let mut short = submit_req("short", "m", TaskPriority::Normal);
    short.timeout_seconds = Some(60);
    let short = h.submit(short, t0).await;
    let long = h.submit(submit_req("long", "m", TaskPriority::Normal), t0).await;

    let w1 = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;
    let w2 = h.register(register_req("w2", &["m"], 2.0, 4 * GIB, 1.0), t0).await;
    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 2);
    for w in [w1.id, w2.id] {
        let current = h.worker(w).await.current_task_id.expect("assigned");
        h.report(w, report_req(WorkerStatus::Busy, current, ReportedOutcome::Running), t0)
            .await;
    }

    // At t+61 only the short-budget task expires; the other keeps running
    // under the 30-minute ceiling.
    let t_sweep = t0 + Duration::seconds(61);
    assert_eq!(h.sweeper.run_once(t_sweep).await.expect("sweep"), 1);
    assert_eq!(h.task(short.id).await.status, TaskStatus::Failed);
    assert_eq!(h.task(long.id).await.status, TaskStatus::Running);

    // Past the ceiling the long task expires too.
    let t_ceiling = t0 + Duration::seconds(h.config.task_timeout.as_secs() as i64 + 1);
    assert_eq!(h.sweeper.run_once(t_ceiling).await.expect("sweep"), 1);
    assert_eq!(h.task(long.id).await.status, TaskStatus::Failed);
}

#[tokio::test]
async fn cancel_before_assignment_skips_the_task() {
    let h = Harness::new();
    let t0 = Utc::now();

    let task = h.submit(submit_req("t", "m", TaskPriority::Normal), t0).await;
    let cancelled = cancel_task(
        h.store.as_ref(),
        h.ledger.as_ref(),
        h.metrics.as_ref(),
        task.id,
        t0,
    )
    .await
    .expect("cancel should succeed");
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;
    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 0);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancel_of_scheduled_task_frees_the_worker() {
    let h = Harness::new();
    let t0 = Utc::now();

    let task = h.submit(submit_req("t", "m", TaskPriority::Normal), t0).await;
    let worker = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;
    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 1);

    cancel_task(
        h.store.as_ref(),
        h.ledger.as_ref(),
        h.metrics.as_ref(),
        task.id,
        t0,
    )
    .await
    .expect("cancel should succeed");

    assert_eq!(h.task(task.id).await.status, TaskStatus::Cancelled);
    let freed = h.worker(worker.id).await;
    assert_eq!(freed.status, WorkerStatus::Available);
    assert_eq!(freed.current_task_id, None);
    assert_eq!(h.ledger.snapshot(worker.id), Committed::default());
}

#[tokio::test]
async fn cancel_of_running_task_is_a_conflict() {
    let h = Harness::new();
    let t0 = Utc::now();

    let task = h.submit(submit_req("t", "m", TaskPriority::Normal), t0).await;
    let worker = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;
    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 1);
    h.report(
        worker.id,
        report_req(WorkerStatus::Busy, task.id, ReportedOutcome::Running),
        t0,
    )
    .await;

    let err = cancel_task(
        h.store.as_ref(),
        h.ledger.as_ref(),
        h.metrics.as_ref(),
        task.id,
        t0,
    )
    .await
    .expect_err("cancel should conflict");
    assert!(matches!(
        err,
        CancelError::Conflict {
            status: TaskStatus::Running,
            ..
        }
    ));
    assert_eq!(h.task(task.id).await.status, TaskStatus::Running);
}

#[tokio::test]
async fn duplicate_terminal_report_is_idempotent() {
    let h = Harness::new();
    let t0 = Utc::now();

    let task = h.submit(submit_req("t", "m", TaskPriority::Normal), t0).await;
    let worker = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;
    assert_eq!(h.engine.run_once(t0).await.expect("pass"), 1);

    let mut done = report_req(WorkerStatus::Available, task.id, ReportedOutcome::Completed);
    done.task_output = Some(b"ok".to_vec());
    h.report(worker.id, done.clone(), t0).await;
    let first_task = h.task(task.id).await;
    let first_worker = h.worker(worker.id).await;

    // Same delivery again: same final state.
    h.report(worker.id, done, t0 + Duration::seconds(1)).await;
    let second_task = h.task(task.id).await;
    let second_worker = h.worker(worker.id).await;

    assert_eq!(second_task.status, TaskStatus::Completed);
    assert_eq!(second_task.completed_at, first_task.completed_at);
    assert_eq!(second_task.output, first_task.output);
    assert_eq!(second_worker.total_tasks_handled, first_worker.total_tasks_handled);
    assert_eq!(second_worker.status, WorkerStatus::Available);
    assert_eq!(h.ledger.snapshot(worker.id), Committed::default());
}

#[tokio::test]
async fn heartbeat_keeps_worker_eligible_and_revives_offline() {
    let h = Harness::new();
    let t0 = Utc::now();

    let worker = h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;

    // Expire the worker, then heartbeat: it comes back available.
    let late = t0 + h.config.stale_after() + Duration::seconds(1);
    assert_eq!(h.liveness.run_once(late).await.expect("pass"), 1);
    assert_eq!(h.worker(worker.id).await.status, WorkerStatus::Offline);

    drover_core::service::heartbeat(h.store.as_ref(), worker.id, late)
        .await
        .expect("heartbeat should succeed");
    let revived = h.worker(worker.id).await;
    assert_eq!(revived.status, WorkerStatus::Available);
    assert_eq!(revived.last_heartbeat, late);

    // And it is assignable again.
    let task = h.submit(submit_req("t", "m", TaskPriority::Normal), late).await;
    assert_eq!(h.engine.run_once(late).await.expect("pass"), 1);
    assert_eq!(h.task(task.id).await.worker_id, Some(worker.id));
}

#[tokio::test]
async fn scheduler_loop_assigns_and_stops_on_cancel() {
    use tokio_util::sync::CancellationToken;

    let h = Harness::new();
    let t0 = Utc::now();
    let task = h.submit(submit_req("t", "m", TaskPriority::Normal), t0).await;
    h.register(register_req("w1", &["m"], 2.0, 4 * GIB, 1.0), t0).await;

    let config = SchedulerConfig {
        poll_interval: StdDuration::from_millis(10),
        ..SchedulerConfig::default()
    };
    let store_dyn: Arc<dyn TaskStore> = h.store.clone();
    let scheduler =
        drover_core::scheduler::Scheduler::new(store_dyn, h.ledger.clone(), h.metrics.clone(), config);

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    // The assignment tick picks the task up within a few periods.
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::Scheduled);

    cancel.cancel();
    tokio::time::timeout(StdDuration::from_secs(1), handle)
        .await
        .expect("scheduler should stop on cancel")
        .expect("scheduler task should not panic");
}
