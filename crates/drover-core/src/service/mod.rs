//! Ingress-facing operations: the validation, cancellation, registration,
//! heartbeat, and status-report rules that sit between the HTTP layer and
//! the store. Errors at this seam are typed so the transport can map them
//! to status codes without string matching.

pub mod tasks;
pub mod workers;

pub use tasks::{CancelError, SubmitError, SubmitTask, cancel_task, submit_task};
pub use workers::{
    RegisterError, RegisterWorker, ReportError, ReportedOutcome, WorkerReport, heartbeat,
    register_worker, report_status,
};
