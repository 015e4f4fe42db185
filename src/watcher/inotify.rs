//! Watcher implementation for the Linux inotify API.
//!
//! One inotify descriptor serves the whole watcher. The reader multiplexes
//! it with an internal pipe so that `close` can interrupt a blocked wait
//! without closing the descriptor under the reader.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::Error;
use crate::event::{Event, Op};
use crate::path::clean;
use crate::registry::Registry;

const BUFFER_LEN: usize = 64 * 1024;

pub struct Watcher {
    /// Delivers the normalized file system events, in kernel order.
    pub events: Receiver<Event>,
    /// Delivers non-fatal errors observed by the reader.
    pub errors: Receiver<Error>,
    shared: Arc<Shared>,
    watches: Mutex<Watches>,
    wake: OwnedFd,
    done_tx: Mutex<Option<Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    registry: Mutex<Registry<WatchDescriptor>>,
    closed: AtomicBool,
}

fn watch_mask() -> WatchMask {
    WatchMask::MOVED_TO
        | WatchMask::MOVED_FROM
        | WatchMask::CREATE
        | WatchMask::ATTRIB
        | WatchMask::MODIFY
        | WatchMask::MOVE_SELF
        | WatchMask::CLOSE_WRITE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
}

impl Watcher {
    /// Create a watcher and spawn its reader thread.
    pub fn new() -> Result<Watcher, Error> {
        let inotify = Inotify::init()?;
        let watches = inotify.watches();
        let (pipe_rd, pipe_wr) = nix::unistd::pipe().map_err(io::Error::from)?;

        let (events_tx, events) = bounded(0);
        let (errors_tx, errors) = bounded(0);
        let (done_tx, done_rx) = bounded(0);
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::new()),
            closed: AtomicBool::new(false),
        });

        let reader = ReadLoop {
            inotify,
            buffer: vec![0; BUFFER_LEN],
            pipe: pipe_rd,
            shared: Arc::clone(&shared),
            events_tx,
            errors_tx,
            done_rx,
        };
        let reader = thread::Builder::new()
            .name("fswatch-inotify".to_string())
            .spawn(move || reader.run())?;

        Ok(Watcher {
            events,
            errors,
            shared,
            watches: Mutex::new(watches),
            wake: pipe_wr,
            done_tx: Mutex::new(Some(done_tx)),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Start watching the given path. Repeated calls for an already watched
    /// path extend the existing watch.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = clean(path.as_ref());
        let mut registry = self.shared.registry.lock().unwrap();
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::WatcherClosed);
        }

        let mut mask = watch_mask();
        if let Some(entry) = registry.get(&path) {
            // the kernel keeps the existing watch; extend its mask instead
            // of replacing it
            mask |= WatchMask::from_bits_truncate(entry.flags) | WatchMask::MASK_ADD;
        }
        let wd = self.watches.lock().unwrap().add(&path, mask)?;
        log::trace!("watching {}", path.display());

        mask.remove(WatchMask::MASK_ADD);
        let is_dir = path.is_dir();
        registry.insert(path, wd, mask.bits(), is_dir);
        Ok(())
    }

    /// Stop watching the given path.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = clean(path.as_ref());
        let mut registry = self.shared.registry.lock().unwrap();
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::WatcherClosed);
        }
        let entry = registry
            .remove_path(&path)
            .ok_or(Error::WatchDoesNotExist(path))?;

        match self.watches.lock().unwrap().remove(entry.handle) {
            Ok(()) => Ok(()),
            // the kernel already dropped the watch (target deleted or moved)
            Err(e) if e.raw_os_error() == Some(nix::libc::EINVAL) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot of the currently watched paths.
    pub fn watch_list(&self) -> Vec<PathBuf> {
        self.shared.registry.lock().unwrap().paths()
    }

    /// Stop the reader, release every watch and close the `events` and
    /// `errors` channels. Later calls return `Ok` immediately.
    pub fn close(&self) -> Result<(), Error> {
        {
            let _registry = self.shared.registry.lock().unwrap();
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        // release a reader blocked in a rendezvous send, then one blocked
        // in poll; the pipe may be gone if the reader died on its own
        self.done_tx.lock().unwrap().take();
        let _ = nix::unistd::write(&self.wake, &[0]);
        if let Some(reader) = self.reader.lock().unwrap().take() {
            let _ = reader.join();
        }

        // watch descriptors died with the inotify descriptor the reader
        // dropped on exit
        self.shared.registry.lock().unwrap().drain();
        Ok(())
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

struct ReadLoop {
    inotify: Inotify,
    buffer: Vec<u8>,
    pipe: OwnedFd,
    shared: Arc<Shared>,
    events_tx: Sender<Event>,
    errors_tx: Sender<Error>,
    done_rx: Receiver<()>,
}

impl ReadLoop {
    fn run(mut self) {
        let inotify_fd = self.inotify.as_raw_fd();
        loop {
            // the inotify crate only hands out the raw descriptor
            let inotify_fd = unsafe { BorrowedFd::borrow_raw(inotify_fd) };
            let mut fds = [
                PollFd::new(inotify_fd, PollFlags::POLLIN),
                PollFd::new(self.pipe.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.send_error(Error::Io(io::Error::from(e)));
                    break;
                }
                Ok(_) => {}
            }
            let readable = ready(&fds[0]);
            let woken = ready(&fds[1]);
            drop(fds);

            if woken {
                break;
            }
            if readable && !self.drain() {
                break;
            }
        }

        // close events before errors
        drop(self.events_tx);
        drop(self.errors_tx);
    }

    /// Read and translate everything the descriptor has queued. Returns
    /// `false` when the reader must exit.
    fn drain(&mut self) -> bool {
        loop {
            let records: Vec<(WatchDescriptor, EventMask, Option<OsString>)> =
                match self.inotify.read_events(&mut self.buffer) {
                    Ok(events) => events
                        .map(|e| (e.wd, e.mask, e.name.map(OsString::from)))
                        .collect(),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // unrecoverable descriptor failure; report and stop
                        self.send_error(Error::Io(e));
                        return false;
                    }
                };
            for (wd, mask, name) in records {
                if !self.handle_record(wd, mask, name) {
                    return false;
                }
            }
        }
    }

    fn handle_record(&self, wd: WatchDescriptor, mask: EventMask, name: Option<OsString>) -> bool {
        if mask.contains(EventMask::Q_OVERFLOW) {
            log::warn!("inotify queue overflowed, events were dropped");
            if !self.send_error(Error::EventOverflow) {
                return false;
            }
        }

        let watched = {
            let mut registry = self.shared.registry.lock().unwrap();
            if mask.contains(EventMask::IGNORED) {
                // the kernel dropped the watch; forget the entry silently
                registry.remove_handle(&wd);
                return true;
            }
            registry.path_for(&wd).map(Path::to_path_buf)
        };
        let Some(watched) = watched else {
            // event for a watch that was removed concurrently
            return true;
        };

        let path = match name {
            Some(name) => clean(&watched.join(name)),
            None => watched,
        };
        let op = translate_mask(mask);
        if op.is_empty() {
            return true;
        }
        self.send_event(Event::new(path, op))
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

fn ready(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
        .unwrap_or(false)
}

fn translate_mask(mask: EventMask) -> Op {
    let mut op = Op::empty();
    if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
        op |= Op::CREATE;
    }
    if mask.intersects(EventMask::MODIFY | EventMask::CLOSE_WRITE) {
        op |= Op::WRITE;
    }
    if mask.contains(EventMask::ATTRIB) {
        op |= Op::CHMOD;
    }
    if mask.intersects(EventMask::MOVED_FROM | EventMask::MOVE_SELF) {
        op |= Op::RENAME;
    }
    if mask.intersects(EventMask::DELETE | EventMask::DELETE_SELF) {
        op |= Op::REMOVE;
    }
    op
}

#[cfg(test)]
mod tests {
    use inotify::EventMask;

    use crate::event::Op;
    use crate::watcher::inotify::translate_mask;

    #[test]
    fn mask_translation() {
        assert_eq!(translate_mask(EventMask::CREATE), Op::CREATE);
        assert_eq!(translate_mask(EventMask::MOVED_TO), Op::CREATE);
        assert_eq!(translate_mask(EventMask::MODIFY), Op::WRITE);
        assert_eq!(translate_mask(EventMask::CLOSE_WRITE), Op::WRITE);
        assert_eq!(translate_mask(EventMask::ATTRIB), Op::CHMOD);
        assert_eq!(translate_mask(EventMask::MOVED_FROM), Op::RENAME);
        assert_eq!(translate_mask(EventMask::MOVE_SELF), Op::RENAME);
        assert_eq!(translate_mask(EventMask::DELETE), Op::REMOVE);
        assert_eq!(translate_mask(EventMask::DELETE_SELF), Op::REMOVE);
    }

    #[test]
    fn unrelated_mask_is_empty() {
        assert_eq!(translate_mask(EventMask::OPEN), Op::empty());
        assert_eq!(translate_mask(EventMask::ACCESS), Op::empty());
    }

    #[test]
    fn combined_mask_keeps_both_bits() {
        let mask = EventMask::MODIFY | EventMask::ATTRIB;
        assert_eq!(translate_mask(mask), Op::WRITE | Op::CHMOD);
    }
}
