#![warn(rust_2018_idioms, missing_debug_implementations)]

//! Cross-platform file system change notifications.
//!
//! A [`Watcher`] registers interest in files and directories and delivers a
//! stream of [`Event`]s describing creations, writes, removals, renames and
//! attribute changes on those paths. Linux inotify, BSD/macOS kqueue and
//! Windows `ReadDirectoryChangesW` are unified behind the same event model.
//!
//! Watches are non-recursive: a watch on a directory reports events for the
//! directory itself and its immediate children only.
//!
//! ```no_run
//! use fswatch::Watcher;
//!
//! let watcher = Watcher::new()?;
//! watcher.add("/tmp")?;
//! for event in watcher.events.iter() {
//!     println!("{event}");
//! }
//! # Ok::<(), fswatch::Error>(())
//! ```

pub use error::Error;
pub use event::{Event, Op};
pub use watcher::Watcher;

mod error;
mod event;
mod path;
mod registry;
mod watcher;
