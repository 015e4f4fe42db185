//! Bookkeeping for active watches: a bijective map between cleaned user
//! paths and backend handles, with the inverse direction used to resolve
//! kernel events back to paths.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub(crate) struct WatchEntry<H> {
    pub path: PathBuf,
    pub handle: H,
    pub flags: u32,
    pub is_dir: bool,
}

#[derive(Debug)]
pub(crate) struct Registry<H> {
    by_path: HashMap<PathBuf, WatchEntry<H>>,
    by_handle: HashMap<H, PathBuf>,
}

// each backend uses a different subset of these accessors
#[allow(dead_code)]
impl<H: Clone + Eq + Hash> Registry<H> {
    pub fn new() -> Self {
        Registry {
            by_path: HashMap::new(),
            by_handle: HashMap::new(),
        }
    }

    /// Insert a watch, replacing any previous entry for the same path so the
    /// path/handle mapping stays bijective.
    pub fn insert(&mut self, path: PathBuf, handle: H, flags: u32, is_dir: bool) {
        if let Some(old) = self.by_path.remove(&path) {
            self.by_handle.remove(&old.handle);
        }
        self.by_handle.insert(handle.clone(), path.clone());
        self.by_path.insert(
            path.clone(),
            WatchEntry {
                path,
                handle,
                flags,
                is_dir,
            },
        );
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<&WatchEntry<H>> {
        self.by_path.get(path)
    }

    pub fn entry_for(&self, handle: &H) -> Option<&WatchEntry<H>> {
        self.by_handle.get(handle).and_then(|p| self.by_path.get(p))
    }

    pub fn path_for(&self, handle: &H) -> Option<&Path> {
        self.by_handle.get(handle).map(PathBuf::as_path)
    }

    pub fn remove_path(&mut self, path: &Path) -> Option<WatchEntry<H>> {
        let entry = self.by_path.remove(path)?;
        self.by_handle.remove(&entry.handle);
        Some(entry)
    }

    pub fn remove_handle(&mut self, handle: &H) -> Option<WatchEntry<H>> {
        let path = self.by_handle.remove(handle)?;
        self.by_path.remove(&path)
    }

    /// Snapshot of all watched paths.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.by_path.keys().cloned().collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<WatchEntry<H>> {
        self.by_handle.clear();
        self.by_path.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use crate::registry::Registry;

    fn registry() -> Registry<i32> {
        let mut reg = Registry::new();
        reg.insert(PathBuf::from("/data/a"), 1, 0, false);
        reg.insert(PathBuf::from("/data/b"), 2, 0, true);
        reg
    }

    #[test]
    fn lookup_both_ways() {
        let reg = registry();
        assert_eq!(reg.get(Path::new("/data/a")).unwrap().handle, 1);
        assert_eq!(reg.path_for(&2), Some(Path::new("/data/b")));
        assert_eq!(reg.entry_for(&2).unwrap().path, PathBuf::from("/data/b"));
        assert!(reg.contains(Path::new("/data/a")));
        assert!(!reg.contains(Path::new("/data/c")));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn reinsert_same_path_stays_bijective() {
        let mut reg = registry();
        reg.insert(PathBuf::from("/data/a"), 3, 0, false);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.path_for(&1), None);
        assert_eq!(reg.path_for(&3), Some(Path::new("/data/a")));
    }

    #[test]
    fn remove_by_path_and_handle() {
        let mut reg = registry();
        let entry = reg.remove_path(Path::new("/data/a")).unwrap();
        assert_eq!(entry.handle, 1);
        assert!(reg.remove_path(Path::new("/data/a")).is_none());
        assert_eq!(reg.path_for(&1), None);

        let entry = reg.remove_handle(&2).unwrap();
        assert_eq!(entry.path, PathBuf::from("/data/b"));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn drain_empties() {
        let mut reg = registry();
        let mut drained = reg.drain();
        drained.sort_by_key(|e| e.handle);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].handle, 1);
        assert_eq!(reg.len(), 0);
        assert!(reg.paths().is_empty());
    }
}
