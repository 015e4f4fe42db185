#[cfg(target_os = "linux")]
pub use inotify::Watcher;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::Watcher;
#[cfg(windows)]
pub use windows::Watcher;

#[cfg(target_os = "linux")]
mod inotify;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(windows)]
mod windows;

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use crossbeam_channel::TryRecvError;
    use tempfile::TempDir;

    use crate::{Error, Event, Op, Watcher};

    fn testdir() -> TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    /// Read events until one on `path` carries `op`, or panic at the
    /// deadline. Unrelated events in between are skipped.
    fn expect_event(watcher: &Watcher, path: &Path, op: Op) -> Event {
        collect_until(watcher, Duration::from_millis(500), |event| {
            event.path == path && event.op.contains(op)
        })
        .unwrap_or_else(|events| {
            panic!("no {op} event for {} (saw {events:?})", path.display())
        })
    }

    fn collect_until(
        watcher: &Watcher,
        timeout: Duration,
        mut found: impl FnMut(&Event) -> bool,
    ) -> Result<Event, Vec<Event>> {
        let deadline = Instant::now() + timeout;
        let mut seen = vec![];
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match watcher.events.recv_timeout(left) {
                Ok(event) if found(&event) => return Ok(event),
                Ok(event) => seen.push(event),
                Err(_) => return Err(seen),
            }
        }
    }

    #[test]
    fn close_right_away() {
        let watcher = Watcher::new().unwrap();
        watcher.close().unwrap();
        watcher.close().unwrap();

        // reader is gone; both channels must be disconnected, not empty
        assert!(matches!(
            watcher.events.try_recv(),
            Err(TryRecvError::Disconnected)
        ));
        assert!(matches!(
            watcher.errors.try_recv(),
            Err(TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn close_slightly_later() {
        let dir = testdir();
        let watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();

        // give the reader time to block in the kernel wait before closing
        thread::sleep(Duration::from_millis(50));
        watcher.close().unwrap();

        assert!(matches!(
            watcher.events.try_recv(),
            Err(TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn closed_watcher_rejects_calls() {
        let dir = testdir();
        let watcher = Watcher::new().unwrap();
        watcher.close().unwrap();

        assert!(matches!(watcher.add(dir.path()), Err(Error::WatcherClosed)));
        assert!(matches!(
            watcher.remove(dir.path()),
            Err(Error::WatcherClosed)
        ));
    }

    #[test]
    fn watch_list_tracks_adds() {
        let dir = testdir();
        let watcher = Watcher::new().unwrap();

        watcher.add(dir.path()).unwrap();
        assert_eq!(watcher.watch_list(), vec![dir.path().to_path_buf()]);

        // repeated add is idempotent
        watcher.add(dir.path()).unwrap();
        assert_eq!(watcher.watch_list().len(), 1);

        watcher.remove(dir.path()).unwrap();
        assert!(watcher.watch_list().is_empty());
        watcher.close().unwrap();
    }

    #[test]
    fn add_trailing_separator_is_same_watch() {
        let dir = testdir();
        let watcher = Watcher::new().unwrap();

        let mut with_sep = dir.path().as_os_str().to_os_string();
        with_sep.push(std::path::MAIN_SEPARATOR.to_string());
        watcher.add(&with_sep).unwrap();
        watcher.add(dir.path()).unwrap();

        assert_eq!(watcher.watch_list(), vec![dir.path().to_path_buf()]);
        watcher.close().unwrap();
    }

    #[test]
    fn add_missing_path() {
        let dir = testdir();
        let watcher = Watcher::new().unwrap();
        let err = watcher.add(dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        watcher.close().unwrap();
    }

    #[test]
    fn double_remove() {
        let dir = testdir();
        let file = dir.path().join("testfile");
        fs::write(&file, "").unwrap();

        let watcher = Watcher::new().unwrap();
        watcher.add(&file).unwrap();

        watcher.remove(&file).unwrap();
        match watcher.remove(&file) {
            Err(Error::WatchDoesNotExist(path)) => assert_eq!(path, file),
            other => panic!("expected WatchDoesNotExist, got {other:?}"),
        }
        assert!(watcher.watch_list().is_empty());
        watcher.close().unwrap();
    }

    #[test]
    fn concurrent_remove_single_winner() {
        let dir = testdir();
        let watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();

        let removed = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if watcher.remove(dir.path()).is_ok() {
                        removed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(watcher.watch_list().is_empty());
        watcher.close().unwrap();
    }

    #[test]
    fn create_file_event() {
        let dir = testdir();
        let watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();

        let file = dir.path().join("testfile");
        fs::write(&file, "").unwrap();

        expect_event(&watcher, &file, Op::CREATE);
        watcher.close().unwrap();
    }

    // kqueue only reports writes for paths with their own watch; a child
    // write does not change the directory entry set
    #[cfg(any(target_os = "linux", windows))]
    #[test]
    fn write_file_event() {
        let dir = testdir();
        let file = dir.path().join("testfile");
        fs::write(&file, "").unwrap();

        let watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();

        fs::write(&file, "data").unwrap();

        expect_event(&watcher, &file, Op::WRITE);
        watcher.close().unwrap();
    }

    #[test]
    fn write_watched_file_event() {
        let dir = testdir();
        let file = dir.path().join("testfile");
        fs::write(&file, "").unwrap();

        let watcher = Watcher::new().unwrap();
        watcher.add(&file).unwrap();

        fs::write(&file, "data").unwrap();

        expect_event(&watcher, &file, Op::WRITE);
        watcher.close().unwrap();
    }

    #[test]
    fn remove_file_event() {
        let dir = testdir();
        let file = dir.path().join("testfile");
        fs::write(&file, "").unwrap();

        let watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();

        fs::remove_file(&file).unwrap();

        expect_event(&watcher, &file, Op::REMOVE);
        watcher.close().unwrap();
    }

    #[test]
    fn rename_emits_old_before_new() {
        let dir = testdir();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        fs::write(&old, "").unwrap();

        let watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();

        fs::rename(&old, &new).unwrap();

        let deadline = Instant::now() + Duration::from_millis(500);
        let mut gone_old = None;
        let mut created_new = None;
        while (gone_old.is_none() || created_new.is_none()) && Instant::now() < deadline {
            let left = deadline.saturating_duration_since(Instant::now());
            let Ok(event) = watcher.events.recv_timeout(left) else {
                break;
            };
            if event.path == old && event.op.intersects(Op::RENAME | Op::REMOVE) {
                gone_old = Some(Instant::now());
            }
            if event.path == new && event.op.contains(Op::CREATE) {
                created_new = Some(Instant::now());
            }
        }

        let gone_old = gone_old.expect("no event for the old name");
        let created_new = created_new.expect("no event for the new name");
        assert!(gone_old <= created_new);
        watcher.close().unwrap();
    }

    // a rename landing on an existing name leaves the directory entry set
    // unchanged, which the kqueue snapshot diff cannot see
    #[cfg(any(target_os = "linux", windows))]
    #[test]
    fn rename_to_overwrite() {
        let dir = testdir();
        let unwatched = testdir();
        let target = dir.path().join("new");
        let source = unwatched.path().join("old");
        fs::write(&target, "").unwrap();
        fs::write(&source, "").unwrap();

        let watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();

        fs::rename(&source, &target).unwrap();

        let seen = collect_until(&watcher, Duration::from_millis(500), |event| {
            event.path == target
        });
        assert!(seen.is_ok(), "no event for the overwritten name");
        watcher.close().unwrap();
    }

    #[test]
    fn many_creates_are_observed() {
        let dir = testdir();
        let watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();

        let producer = thread::spawn({
            let root = dir.path().to_path_buf();
            move || {
                for i in 0..200 {
                    fs::write(root.join(format!("testfile{i}")), "").unwrap();
                }
            }
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut creates = 0;
        while creates < 50 && Instant::now() < deadline {
            let left = deadline.saturating_duration_since(Instant::now());
            match watcher.events.recv_timeout(left) {
                Ok(event) if event.op.contains(Op::CREATE) => creates += 1,
                Ok(_) => {}
                Err(_) => break,
            }
        }

        producer.join().unwrap();
        assert!(creates >= 50, "only {creates} create events arrived");
        watcher.close().unwrap();
    }

    #[test]
    fn drop_without_close_does_not_hang() {
        let dir = testdir();
        let watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();
        drop(watcher);
    }
}
