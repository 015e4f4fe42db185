//! Watcher implementation for the BSD/macOS kqueue API.
//!
//! kqueue reports vnode events per open descriptor and knows nothing about
//! directory children, so the watcher keeps a name snapshot per watched
//! directory and synthesizes create/remove events by rescanning on every
//! directory write. Cancellation uses an `EVFILT_USER` event so a blocked
//! `kevent` wait can be interrupted without touching the queue descriptor.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use nix::sys::stat::Mode;

use crate::error::Error;
use crate::event::{Event, Op};
use crate::path::clean;
use crate::registry::Registry;

/// Ident of the user event `close` triggers to stop the reader.
const WAKE_IDENT: usize = 0;

pub struct Watcher {
    /// Delivers the normalized file system events, in kernel order.
    pub events: Receiver<Event>,
    /// Delivers non-fatal errors observed by the reader.
    pub errors: Receiver<Error>,
    inner: Arc<Inner>,
    done_tx: Mutex<Option<Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    kq: Kqueue,
    state: Mutex<State>,
    closed: AtomicBool,
}

struct State {
    registry: Registry<RawFd>,
    /// Last observed child names per watched directory, used to compute
    /// create/remove deltas on directory writes.
    children: HashMap<PathBuf, HashSet<OsString>>,
}

fn vnode_flags() -> FilterFlag {
    FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_RENAME
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn open_flags() -> OFlag {
    // O_EVTONLY does not block unmounting the watched file system
    OFlag::O_EVTONLY
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn open_flags() -> OFlag {
    OFlag::O_RDONLY | OFlag::O_NONBLOCK
}

impl Watcher {
    /// Create a watcher and spawn its reader thread.
    pub fn new() -> Result<Watcher, Error> {
        let kq = Kqueue::new().map_err(io::Error::from)?;

        // register the wake event up front so triggering it can never fail
        let wake = KEvent::new(
            WAKE_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            FilterFlag::empty(),
            0,
            0,
        );
        let mut none: [KEvent; 0] = [];
        kq.kevent(&[wake], &mut none, None)
            .map_err(io::Error::from)?;

        let (events_tx, events) = bounded(0);
        let (errors_tx, errors) = bounded(0);
        let (done_tx, done_rx) = bounded(0);
        let inner = Arc::new(Inner {
            kq,
            state: Mutex::new(State {
                registry: Registry::new(),
                children: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
        });

        let reader = ReadLoop {
            inner: Arc::clone(&inner),
            events_tx,
            errors_tx,
            done_rx,
        };
        let reader = thread::Builder::new()
            .name("fswatch-kqueue".to_string())
            .spawn(move || reader.run())?;

        Ok(Watcher {
            events,
            errors,
            inner,
            done_tx: Mutex::new(Some(done_tx)),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Start watching the given path. Repeated calls for an already watched
    /// path refresh its directory snapshot.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = clean(path.as_ref());
        let mut state = self.inner.state.lock().unwrap();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::WatcherClosed);
        }

        if let Some(entry) = state.registry.get(&path) {
            if entry.is_dir {
                let snapshot = scan_children(&path);
                state.children.insert(path, snapshot);
            }
            return Ok(());
        }

        let fd = nix::fcntl::open(&path, open_flags(), Mode::empty())
            .map_err(|e| Error::Io(e.into()))?;
        let fflags = vnode_flags();
        let kev = KEvent::new(
            fd as usize,
            EventFilter::EVFILT_VNODE,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR | EventFlag::EV_ENABLE,
            fflags,
            0,
            0,
        );
        let mut none: [KEvent; 0] = [];
        if let Err(e) = self.inner.kq.kevent(&[kev], &mut none, None) {
            let _ = nix::unistd::close(fd);
            return Err(Error::Io(e.into()));
        }
        log::trace!("watching {}", path.display());

        let is_dir = fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
        if is_dir {
            state.children.insert(path.clone(), scan_children(&path));
        }
        state.registry.insert(path, fd, fflags.bits(), is_dir);
        Ok(())
    }

    /// Stop watching the given path.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = clean(path.as_ref());
        let mut state = self.inner.state.lock().unwrap();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::WatcherClosed);
        }
        let entry = state
            .registry
            .remove_path(&path)
            .ok_or(Error::WatchDoesNotExist(path.clone()))?;
        state.children.remove(&path);
        release(&self.inner.kq, entry.handle)
    }

    /// Snapshot of the currently watched paths.
    pub fn watch_list(&self) -> Vec<PathBuf> {
        self.inner.state.lock().unwrap().registry.paths()
    }

    /// Stop the reader, release every watch and close the `events` and
    /// `errors` channels. Later calls return `Ok` immediately.
    pub fn close(&self) -> Result<(), Error> {
        {
            let _state = self.inner.state.lock().unwrap();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        // release a reader blocked in a rendezvous send, then trigger the
        // user event for one blocked in kevent
        self.done_tx.lock().unwrap().take();
        let trigger = KEvent::new(
            WAKE_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::empty(),
            FilterFlag::NOTE_TRIGGER,
            0,
            0,
        );
        let mut none: [KEvent; 0] = [];
        let _ = self.inner.kq.kevent(&[trigger], &mut none, None);
        if let Some(reader) = self.reader.lock().unwrap().take() {
            let _ = reader.join();
        }

        // release the remaining descriptors, reporting the first failure
        let mut state = self.inner.state.lock().unwrap();
        state.children.clear();
        let mut first_err = None;
        for entry in state.registry.drain() {
            if let Err(e) = release(&self.inner.kq, entry.handle) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("watches", &self.watch_list())
            .finish_non_exhaustive()
    }
}

/// Deregister the vnode filter and close the descriptor.
fn release(kq: &Kqueue, fd: RawFd) -> Result<(), Error> {
    let kev = KEvent::new(
        fd as usize,
        EventFilter::EVFILT_VNODE,
        EventFlag::EV_DELETE,
        FilterFlag::empty(),
        0,
        0,
    );
    let mut none: [KEvent; 0] = [];
    if let Err(e) = kq.kevent(&[kev], &mut none, None) {
        // ENOENT means the kernel already dropped the filter with the vnode
        if e != Errno::ENOENT {
            log::debug!("deregistering fd {fd}: {e}");
        }
    }
    nix::unistd::close(fd).map_err(|e| Error::Io(e.into()))
}

fn scan_children(dir: &Path) -> HashSet<OsString> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok().map(|e| e.file_name()))
                .collect()
        })
        .unwrap_or_default()
}

fn vnode_op(fflags: FilterFlag, is_dir: bool) -> Op {
    let mut op = Op::empty();
    if fflags.contains(FilterFlag::NOTE_DELETE) {
        op |= Op::REMOVE;
    } else if fflags.contains(FilterFlag::NOTE_RENAME) {
        op |= Op::RENAME;
    }
    if fflags.contains(FilterFlag::NOTE_ATTRIB) {
        op |= Op::CHMOD;
    }
    // a write to a directory only means its entries changed; the rescan
    // reports which ones
    if fflags.contains(FilterFlag::NOTE_WRITE) && !is_dir {
        op |= Op::WRITE;
    }
    op
}

struct ReadLoop {
    inner: Arc<Inner>,
    events_tx: Sender<Event>,
    errors_tx: Sender<Error>,
    done_rx: Receiver<()>,
}

impl ReadLoop {
    fn run(self) {
        let mut eventlist = vec![
            KEvent::new(
                0,
                EventFilter::EVFILT_VNODE,
                EventFlag::empty(),
                FilterFlag::empty(),
                0,
                0,
            );
            16
        ];
        'outer: loop {
            let n = match self.inner.kq.kevent(&[], &mut eventlist, None) {
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    // unrecoverable queue failure; report and stop
                    self.send_error(Error::Io(e.into()));
                    break;
                }
                Ok(n) => n,
            };
            for kev in eventlist.iter().take(n) {
                match kev.filter() {
                    Ok(EventFilter::EVFILT_USER) => break 'outer,
                    Ok(EventFilter::EVFILT_VNODE) => {
                        if !self.handle_vnode(kev.ident() as RawFd, kev.fflags()) {
                            break 'outer;
                        }
                    }
                    _ => {}
                }
            }
        }

        // close events before errors
        drop(self.events_tx);
        drop(self.errors_tx);
    }

    fn handle_vnode(&self, fd: RawFd, fflags: FilterFlag) -> bool {
        let entry = {
            let state = self.inner.state.lock().unwrap();
            state
                .registry
                .entry_for(&fd)
                .map(|e| (e.path.clone(), e.is_dir))
        };
        let Some((path, is_dir)) = entry else {
            // stale event for a watch that was removed concurrently
            return true;
        };

        // a rename or delete leaves the descriptor pointing at a dead
        // vnode; reap the entry before reporting
        let terminal = fflags.intersects(FilterFlag::NOTE_DELETE | FilterFlag::NOTE_RENAME);
        if terminal {
            let removed = {
                let mut state = self.inner.state.lock().unwrap();
                state.children.remove(&path);
                state.registry.remove_path(&path)
            };
            if let Some(entry) = removed {
                if let Err(e) = release(&self.inner.kq, entry.handle) {
                    log::debug!("releasing watch on {}: {}", path.display(), e);
                }
            }
        }

        let op = vnode_op(fflags, is_dir);
        if !op.is_empty() && !self.send_event(Event::new(path.clone(), op)) {
            return false;
        }
        if !terminal && is_dir && fflags.contains(FilterFlag::NOTE_WRITE) {
            return self.rescan(&path);
        }
        true
    }

    /// Diff the directory against its last snapshot and synthesize
    /// create/remove events for changed children.
    fn rescan(&self, dir: &Path) -> bool {
        let current = scan_children(dir);
        let previous = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.registry.contains(dir) {
                // watch removed while we were scanning
                return true;
            }
            state
                .children
                .insert(dir.to_path_buf(), current.clone())
                .unwrap_or_default()
        };

        // vanished names go first so a rename inside the directory reports
        // the old name before the new one
        for name in previous.difference(&current) {
            if !self.send_event(Event::new(clean(&dir.join(name)), Op::REMOVE)) {
                return false;
            }
        }
        for name in current.difference(&previous) {
            if !self.send_event(Event::new(clean(&dir.join(name)), Op::CREATE)) {
                return false;
            }
        }
        true
    }

    fn send_event(&self, event: Event) -> bool {
        select! {
            send(self.events_tx, event) -> res => res.is_ok(),
            recv(self.done_rx) -> _ => false,
        }
    }

    fn send_error(&self, error: Error) -> bool {
        select! {
            send(self.errors_tx, error) -> res => res.is_ok(),
            recv(self.done_rx) -> _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::event::FilterFlag;

    use crate::event::Op;
    use crate::watcher::kqueue::vnode_op;

    #[test]
    fn flag_translation() {
        assert_eq!(vnode_op(FilterFlag::NOTE_DELETE, false), Op::REMOVE);
        assert_eq!(vnode_op(FilterFlag::NOTE_RENAME, false), Op::RENAME);
        assert_eq!(vnode_op(FilterFlag::NOTE_ATTRIB, false), Op::CHMOD);
        assert_eq!(vnode_op(FilterFlag::NOTE_WRITE, false), Op::WRITE);
    }

    #[test]
    fn directory_write_has_no_direct_op() {
        assert_eq!(vnode_op(FilterFlag::NOTE_WRITE, true), Op::empty());
    }

    #[test]
    fn delete_wins_over_rename() {
        let flags = FilterFlag::NOTE_DELETE | FilterFlag::NOTE_RENAME;
        assert_eq!(vnode_op(flags, false), Op::REMOVE);
    }

    #[test]
    fn coalesced_write_and_attrib() {
        let flags = FilterFlag::NOTE_WRITE | FilterFlag::NOTE_ATTRIB;
        assert_eq!(vnode_op(flags, false), Op::WRITE | Op::CHMOD);
    }
}
