//! Metrics sink boundary.
//!
//! The core records counters and gauges through this trait so that the
//! exporter stays out of the scheduling code. [`PromSink`] forwards to the
//! `metrics` facade (rendered by the Prometheus exporter installed in the
//! binary); [`NullSink`] keeps tests silent.

use drover_db::models::TaskPriority;

pub trait MetricsSink: Send + Sync {
    fn task_submitted(&self, priority: TaskPriority);
    fn task_assigned(&self, model_name: &str);
    fn task_completed(&self);
    fn task_failed(&self, reason: &'static str);
    fn task_requeued(&self);
    fn task_cancelled(&self);
    fn worker_offline(&self);
    /// Pending tasks that found no fitting worker this pass, per model tag.
    fn queue_depth(&self, model_name: &str, depth: i64);
}

/// Sink over the `metrics` macro facade.
pub struct PromSink;

impl MetricsSink for PromSink {
    fn task_submitted(&self, priority: TaskPriority) {
        metrics::counter!("tasks.submitted", "priority" => priority.to_string()).increment(1);
    }

    fn task_assigned(&self, model_name: &str) {
        metrics::counter!("tasks.assigned", "model" => model_name.to_owned()).increment(1);
    }

    fn task_completed(&self) {
        metrics::counter!("tasks.completed").increment(1);
    }

    fn task_failed(&self, reason: &'static str) {
        metrics::counter!("tasks.failed", "reason" => reason).increment(1);
    }

    fn task_requeued(&self) {
        metrics::counter!("tasks.requeued").increment(1);
    }

    fn task_cancelled(&self) {
        metrics::counter!("tasks.cancelled").increment(1);
    }

    fn worker_offline(&self) {
        metrics::counter!("workers.marked_offline").increment(1);
    }

    fn queue_depth(&self, model_name: &str, depth: i64) {
        metrics::gauge!("tasks.queue_depth", "model" => model_name.to_owned()).set(depth as f64);
    }
}

/// No-op sink for tests.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn task_submitted(&self, _priority: TaskPriority) {}
    fn task_assigned(&self, _model_name: &str) {}
    fn task_completed(&self) {}
    fn task_failed(&self, _reason: &'static str) {}
    fn task_requeued(&self) {}
    fn task_cancelled(&self) {}
    fn worker_offline(&self) {}
    fn queue_depth(&self, _model_name: &str, _depth: i64) {}
}
