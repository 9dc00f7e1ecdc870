//! Acknowledgment batching, retries, outcome caching and bookkeeping

pub mod batch;
pub mod cache;
pub mod coordinator;
pub mod retry;
pub mod types;

pub use coordinator::{AcknowledgmentCoordinator, CoordinatorContext};
pub use retry::RetryPolicy;
pub use types::{AckStatus, Acknowledgment, CachedOutcome, DispatchRequest, PendingKey, PendingSend};
