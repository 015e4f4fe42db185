//! Watcher implementation for the Windows `ReadDirectoryChangesW` API.
//!
//! Every watched directory keeps one overlapped read outstanding against a
//! shared I/O completion port, writing into one half of a double-buffered
//! record region while the reader decodes the other half. Only directories
//! accept change notifications, so a watch on a file is a watch on its
//! parent directory filtered to the child name.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use widestring::{U16CString, U16String};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_OPERATION_ABORTED, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE,
    FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
    OVERLAPPED,
};

use crate::error::Error;
use crate::event::{Event, Op};
use crate::path::clean;
use crate::registry::Registry;

/// Half of a directory's record region, in 32-bit words (64 KiB; larger
/// buffers fail over network shares).
const BUF_DWORDS: usize = 16 * 1024;

/// Completion key `close` posts to stop the reader.
const WAKE_KEY: usize = 0;

const FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_SECURITY;

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
    port: Port,
    state: Mutex<State>,
    closed: AtomicBool,
    next_key: AtomicUsize,
}

/// Completion port handle; the kernel object itself is thread safe.
struct Port(HANDLE);
unsafe impl Send for Port {}
unsafe impl Sync for Port {}

struct State {
    registry: Registry<usize>,
    watches: HashMap<usize, DirWatch>,
}

struct DirWatch {
    /// Directory the overlapped read runs against.
    dir: PathBuf,
    /// Set when watching a single file; records for other children of
    /// `dir` are dropped.
    file: Option<PathBuf>,
    handle: HANDLE,
    overlapped: Box<OVERLAPPED>,
    /// Double-buffered record region; `active` is the half armed for the
    /// kernel, the other half is free for decoding.
    bufs: Box<[[u32; BUF_DWORDS]; 2]>,
    active: usize,
    bytes_returned: u32,
    /// Last-write times per child, used to tell attribute-only changes
    /// from data writes.
    mtimes: HashMap<PathBuf, SystemTime>,
    cancelled: bool,
}

// the handle and overlapped region are only touched by the reader and by
// callers holding the state mutex
unsafe impl Send for DirWatch {}

impl Watcher {
    /// Create a watcher and spawn its reader thread.
    pub fn new() -> Result<Watcher, Error> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let (events_tx, events) = bounded(0);
        let (errors_tx, errors) = bounded(0);
        let (done_tx, done_rx) = bounded(0);
        let inner = Arc::new(Inner {
            port: Port(port),
            state: Mutex::new(State {
                registry: Registry::new(),
                watches: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
            next_key: AtomicUsize::new(WAKE_KEY + 1),
        });

        let reader = ReadLoop {
            inner: Arc::clone(&inner),
            events_tx,
            errors_tx,
            done_rx,
        };
        let reader = thread::Builder::new()
            .name("fswatch-rdcw".to_string())
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
    /// path are no-ops.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = clean(path.as_ref());
        let mut state = self.inner.state.lock().unwrap();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::WatcherClosed);
        }
        if state.registry.contains(&path) {
            return Ok(());
        }

        let is_dir = fs::metadata(&path)?.is_dir();
        let (dir, file) = if is_dir {
            (path.clone(), None)
        } else {
            let parent = path
                .parent()
                .ok_or_else(|| Error::Io(io::ErrorKind::NotFound.into()))?;
            (parent.to_path_buf(), Some(path.clone()))
        };

        let wide = U16CString::from_os_str(dir.as_os_str())
            .map_err(|_| Error::Io(io::ErrorKind::InvalidInput.into()))?;
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let key = self.inner.next_key.fetch_add(1, Ordering::SeqCst);
        let port = unsafe { CreateIoCompletionPort(handle, self.inner.port.0, key, 0) };
        if port.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(Error::Io(err));
        }

        let mut watch = DirWatch {
            dir,
            file,
            handle,
            overlapped: Box::new(unsafe { mem::zeroed() }),
            bufs: Box::new([[0; BUF_DWORDS]; 2]),
            active: 0,
            bytes_returned: 0,
            mtimes: HashMap::new(),
            cancelled: false,
        };
        if let Err(e) = arm(&mut watch) {
            unsafe { CloseHandle(handle) };
            return Err(Error::Io(e));
        }
        log::trace!("watching {}", path.display());

        state.watches.insert(key, watch);
        state.registry.insert(path, key, FILTER, is_dir);
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
            .ok_or(Error::WatchDoesNotExist(path))?;

        if let Some(watch) = state.watches.get_mut(&entry.handle) {
            // the reader reaps the watch and closes its handle once the
            // aborted read completes
            watch.cancelled = true;
            unsafe { CancelIoEx(watch.handle, ptr::null()) };
        }
        Ok(())
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

        // release a reader blocked in a rendezvous send, then post the
        // sentinel completion for one blocked in the port wait
        self.done_tx.lock().unwrap().take();
        unsafe { PostQueuedCompletionStatus(self.inner.port.0, 0, WAKE_KEY, ptr::null()) };
        if let Some(reader) = self.reader.lock().unwrap().take() {
            let _ = reader.join();
        }

        // the reader reaped every watch on its way out unless it died on a
        // fatal port failure earlier
        let mut state = self.inner.state.lock().unwrap();
        state.registry.drain();
        for (_, watch) in state.watches.drain() {
            unsafe {
                CancelIoEx(watch.handle, ptr::null());
                CloseHandle(watch.handle);
            }
        }
        unsafe { CloseHandle(self.inner.port.0) };
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

/// Queue the next overlapped read into the active buffer half.
fn arm(watch: &mut DirWatch) -> io::Result<()> {
    let buf = &mut watch.bufs[watch.active];
    let ok = unsafe {
        ReadDirectoryChangesW(
            watch.handle,
            buf.as_mut_ptr() as *mut c_void,
            (BUF_DWORDS * 4) as u32,
            0,
            FILTER,
            &mut watch.bytes_returned,
            &mut *watch.overlapped,
            None,
        )
    };
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Drop a directory watch: close its handle and forget both mappings.
fn reap(state: &mut State, key: usize) {
    if let Some(watch) = state.watches.remove(&key) {
        unsafe { CloseHandle(watch.handle) };
    }
    state.registry.remove_handle(&key);
}

/// Decode the completed buffer half into events, filtered to the watched
/// file when the watch targets a single file.
fn decode(watch: &mut DirWatch, completed: usize, bytes: usize) -> Vec<Event> {
    let mut events = Vec::new();
    let base = watch.bufs[completed].as_ptr() as *const u8;
    let name_offset = mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName);
    let mut offset = 0usize;
    loop {
        // records are only 16-bit aligned under some emulation layers
        let info =
            unsafe { ptr::read_unaligned(base.add(offset) as *const FILE_NOTIFY_INFORMATION) };
        let len = info.FileNameLength as usize / 2;
        let name = unsafe { slice::from_raw_parts(base.add(offset + name_offset) as *const u16, len) };
        let name = U16String::from_vec(name.to_vec()).to_os_string();
        let path = clean(&watch.dir.join(name));

        let keep = watch.file.as_ref().map_or(true, |f| *f == path);
        if keep {
            if let Some(op) = translate_action(info.Action, &path, &mut watch.mtimes) {
                events.push(Event::new(path, op));
            }
        }

        if info.NextEntryOffset == 0 {
            break;
        }
        offset += info.NextEntryOffset as usize;
        if offset >= bytes {
            break;
        }
    }
    events
}

fn translate_action(
    action: u32,
    path: &Path,
    mtimes: &mut HashMap<PathBuf, SystemTime>,
) -> Option<Op> {
    match action {
        FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => {
            if let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) {
                mtimes.insert(path.to_path_buf(), modified);
            }
            Some(Op::CREATE)
        }
        FILE_ACTION_REMOVED => {
            mtimes.remove(path);
            Some(Op::REMOVE)
        }
        FILE_ACTION_RENAMED_OLD_NAME => {
            mtimes.remove(path);
            Some(Op::RENAME)
        }
        FILE_ACTION_MODIFIED => {
            // an unchanged last-write time means only attributes moved
            match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => {
                    let previous = mtimes.insert(path.to_path_buf(), modified);
                    if previous == Some(modified) {
                        Some(Op::CHMOD)
                    } else {
                        Some(Op::WRITE)
                    }
                }
                Err(_) => Some(Op::WRITE),
            }
        }
        _ => None,
    }
}

struct ReadLoop {
    inner: Arc<Inner>,
    events_tx: Sender<Event>,
    errors_tx: Sender<Error>,
    done_rx: Receiver<()>,
}

impl ReadLoop {
    fn run(self) {
        let mut closing = false;
        loop {
            let mut bytes = 0u32;
            let mut key = 0usize;
            let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
            let ok = unsafe {
                GetQueuedCompletionStatus(
                    self.inner.port.0,
                    &mut bytes,
                    &mut key,
                    &mut overlapped,
                    INFINITE,
                )
            };

            if key == WAKE_KEY && overlapped.is_null() {
                if ok == 0 {
                    // the port itself failed under us
                    self.send_error(Error::Io(io::Error::last_os_error()));
                    break;
                }
                // close() asked us to stop: cancel every outstanding read,
                // then drain the aborted completions below
                closing = true;
                let mut state = self.inner.state.lock().unwrap();
                for watch in state.watches.values_mut() {
                    if !watch.cancelled {
                        watch.cancelled = true;
                        unsafe { CancelIoEx(watch.handle, ptr::null()) };
                    }
                }
                if state.watches.is_empty() {
                    break;
                }
                continue;
            }

            let failure = if ok == 0 {
                Some(unsafe { GetLastError() })
            } else {
                None
            };
            if !self.complete(key, bytes, failure) {
                break;
            }
            if closing && self.inner.state.lock().unwrap().watches.is_empty() {
                break;
            }
        }

        // close events before errors
        drop(self.events_tx);
        drop(self.errors_tx);
    }

    /// Handle one dequeued completion. Returns `false` when the reader
    /// must exit.
    fn complete(&self, key: usize, bytes: u32, failure: Option<u32>) -> bool {
        let mut events: Vec<Event> = Vec::new();
        let mut errors: Vec<Error> = Vec::new();

        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.watches.contains_key(&key) {
                // stale completion for a watch reaped earlier
                return true;
            }

            match failure {
                Some(ERROR_OPERATION_ABORTED) => {
                    reap(&mut state, key);
                }
                Some(code) => {
                    let dir_gone = code == ERROR_ACCESS_DENIED
                        && state.watches.get(&key).is_some_and(|w| !w.dir.exists());
                    let watched = state.registry.path_for(&key).map(Path::to_path_buf);
                    reap(&mut state, key);
                    if dir_gone {
                        // the watched directory itself was deleted
                        if let Some(watched) = watched {
                            events.push(Event::new(watched, Op::REMOVE));
                        }
                    } else {
                        errors.push(Error::Io(io::Error::from_raw_os_error(code as i32)));
                    }
                }
                None => {
                    let Some(watch) = state.watches.get_mut(&key) else {
                        return true;
                    };
                    let completed = watch.active;
                    watch.active ^= 1;
                    if watch.cancelled {
                        // the cancel raced with a successful completion, so
                        // no aborted completion will follow
                        reap(&mut state, key);
                    } else {
                        if bytes == 0 {
                            // the kernel could not fit the changes
                            errors.push(Error::EventOverflow);
                        } else {
                            events = decode(watch, completed, bytes as usize);
                        }
                        if let Err(e) = arm(watch) {
                            reap(&mut state, key);
                            errors.push(Error::Io(e));
                        }
                    }
                }
            }
        }

        for event in events {
            if !self.send_event(event) {
                return false;
            }
        }
        for error in errors {
            if !self.send_error(error) {
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
    use std::collections::HashMap;
    use std::path::Path;

    use windows_sys::Win32::Storage::FileSystem::{
        FILE_ACTION_ADDED, FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME,
        FILE_ACTION_RENAMED_OLD_NAME,
    };

    use crate::event::Op;
    use crate::watcher::windows::translate_action;

    #[test]
    fn action_translation() {
        let mut mtimes = HashMap::new();
        let path = Path::new("does-not-exist");

        assert_eq!(
            translate_action(FILE_ACTION_ADDED, path, &mut mtimes),
            Some(Op::CREATE)
        );
        assert_eq!(
            translate_action(FILE_ACTION_RENAMED_NEW_NAME, path, &mut mtimes),
            Some(Op::CREATE)
        );
        assert_eq!(
            translate_action(FILE_ACTION_REMOVED, path, &mut mtimes),
            Some(Op::REMOVE)
        );
        assert_eq!(
            translate_action(FILE_ACTION_RENAMED_OLD_NAME, path, &mut mtimes),
            Some(Op::RENAME)
        );
        assert_eq!(translate_action(0, path, &mut mtimes), None);
    }

    #[test]
    fn rename_clears_the_mtime_cache() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("entry");
        std::fs::write(&file, "").unwrap();

        let mut mtimes = HashMap::new();
        translate_action(FILE_ACTION_ADDED, &file, &mut mtimes);
        assert!(mtimes.contains_key(&file));
        translate_action(FILE_ACTION_RENAMED_OLD_NAME, &file, &mut mtimes);
        assert!(mtimes.is_empty());
    }
}
