use std::fmt;
use std::path::PathBuf;

bitflags::bitflags! {
    /// Set of operations that triggered an [`Event`].
    ///
    /// Backends may combine several bits in one event when the kernel
    /// reports them in a single record, so match with [`Op::contains`]
    /// rather than with equality.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Op: u32 {
        const CREATE = 1 << 0;
        const WRITE  = 1 << 1;
        const REMOVE = 1 << 2;
        const RENAME = 1 << 3;
        const CHMOD  = 1 << 4;
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Op, &str); 5] = [
            (Op::CREATE, "CREATE"),
            (Op::WRITE, "WRITE"),
            (Op::REMOVE, "REMOVE"),
            (Op::RENAME, "RENAME"),
            (Op::CHMOD, "CHMOD"),
        ];
        let mut first = true;
        for (op, name) in NAMES {
            if self.contains(op) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A single file system change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Path of the affected file or directory. Matches the path passed to
    /// [`Watcher::add`](crate::Watcher::add) byte for byte when that path was
    /// already clean, with the child name appended for directory events.
    pub path: PathBuf,
    /// Operations that triggered this event.
    pub op: Op,
}

impl Event {
    pub(crate) fn new(path: PathBuf, op: Op) -> Self {
        Event { path, op }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.op)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::event::{Event, Op};

    #[test]
    fn op_bits() {
        assert_eq!(Op::CREATE.bits(), 1);
        assert_eq!(Op::WRITE.bits(), 2);
        assert_eq!(Op::REMOVE.bits(), 4);
        assert_eq!(Op::RENAME.bits(), 8);
        assert_eq!(Op::CHMOD.bits(), 16);
    }

    #[test]
    fn op_display() {
        assert_eq!(Op::CREATE.to_string(), "CREATE");
        assert_eq!((Op::WRITE | Op::CHMOD).to_string(), "WRITE|CHMOD");
        assert_eq!(
            (Op::CREATE | Op::WRITE | Op::REMOVE | Op::RENAME | Op::CHMOD).to_string(),
            "CREATE|WRITE|REMOVE|RENAME|CHMOD"
        );
        assert_eq!(Op::empty().to_string(), "");
    }

    #[test]
    fn event_display() {
        let event = Event::new(PathBuf::from("/tmp/file"), Op::CREATE | Op::WRITE);
        assert_eq!(event.to_string(), "/tmp/file: CREATE|WRITE");
    }

    #[test]
    fn event_eq() {
        let a = Event::new(PathBuf::from("/tmp/file"), Op::WRITE);
        let b = Event::new(PathBuf::from("/tmp/file"), Op::WRITE);
        let c = Event::new(PathBuf::from("/tmp/other"), Op::WRITE);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Event::new(PathBuf::from("/tmp/file"), Op::CHMOD));
    }
}
