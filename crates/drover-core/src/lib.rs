//! Core scheduling and worker lifecycle for drover: the task store
//! abstraction, the resource ledger, the assignment engine, the liveness
//! monitor, the timeout sweeper, the scheduler loop that drives them, and
//! the ingress-facing service operations.

pub mod engine;
pub mod ledger;
pub mod liveness;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sweeper;
