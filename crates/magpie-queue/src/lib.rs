pub mod broker;
pub mod queue;
pub mod worker;

pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use queue::{FailOutcome, JobQueue, RemoveOutcome};
pub use worker::{JobContext, JobHandler, WorkerPool, WorkerSettings};

pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
