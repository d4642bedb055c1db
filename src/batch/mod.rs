//! Request batching and batch execution.

pub mod batcher;
pub mod executor;
pub mod manager;
pub mod types;

pub use batcher::Batcher;
pub use executor::BatchExecutor;
pub use manager::{JobManager, ManagerStats};
pub use types::*;
