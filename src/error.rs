use std::io;
use std::path::PathBuf;

/// Errors reported by a [`Watcher`](crate::Watcher), either synchronously
/// from its methods or asynchronously on its `errors` channel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The kernel dropped notifications because its queue was full. Some
    /// events were lost; a full rescan is the only way to resynchronize.
    #[error("event queue overflowed")]
    EventOverflow,

    /// The watcher has been closed; no further watches can be added or
    /// removed.
    #[error("watcher already closed")]
    WatcherClosed,

    /// [`Watcher::remove`](crate::Watcher::remove) was called for a path
    /// that is not being watched.
    #[error("can't remove non-existent watch: {0}")]
    WatchDoesNotExist(PathBuf),

    /// An operating system error, e.g. a missing path on
    /// [`Watcher::add`](crate::Watcher::add) or the inotify watch limit
    /// (ENOSPC) being reached.
    #[error(transparent)]
    Io(#[from] io::Error),
}
