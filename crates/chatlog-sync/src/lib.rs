mod error;
mod events;
pub mod history;
pub mod incremental;
pub mod merge;
mod notifier;
mod refresh;
pub mod scheduler;
mod service;
mod staleness;

#[cfg(test)]
mod testing;

pub use error::SyncError;
pub use events::{CacheEvents, CacheUpdated};
pub use history::{HistoryFetcher, HistoryPage, HistoryRequest};
pub use merge::{merge_messages, merge_timeline};
pub use notifier::Notifier;
pub use refresh::RefreshContext;
pub use scheduler::{
    Priority, RefreshRunSummary, RefreshScheduler, RefreshStats, RefreshTaskView, SchedulerReport,
    TaskOutcome, TaskState,
};
pub use service::{SyncService, BACKGROUND_PRIORITY, FOREGROUND_PRIORITY};
pub use staleness::detect_stale;
