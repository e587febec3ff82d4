//! Change detection for configured sync paths.
//!
//! Each replicated entry gets one [`DataWatcher`] that arms kernel inotify
//! watches over the entry's path (or, while the path is absent, its closest
//! existing parent) and translates the raw event stream into coalesced
//! batches of Copy/Delete operations for the sync engine.

use thiserror::Error as ThisError;

mod watch;

pub use watch::DataWatcher;

#[derive(Debug, ThisError)]
pub enum WatchError {
    /// The inotify instance itself could not be created.
    #[error("failed to initialize inotify: {0}")]
    Init(#[source] std::io::Error),

    /// The event channel produced a read error; the watcher must be torn
    /// down and restarted by its owner.
    #[error("inotify event channel failed: {0}")]
    Channel(#[source] std::io::Error),

    /// The event channel ended.
    #[error("inotify event channel closed")]
    Closed,
}
