pub mod error;
pub mod service;
pub mod store;

pub use error::{SchedulerError, SchedulerResult};
pub use service::{CleanupConfig, CleanupHandle, CleanupService};
pub use store::{CleanupRunRecord, SqliteStore};
