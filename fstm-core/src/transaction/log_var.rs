use std::any::Any;
use std::sync::Arc;

use crate::tvar::VarControlBlock;

pub type ArcAny = Arc<dyn Any + Send + Sync>;

/// `LogVar` is used by `Transaction` to track a var that was read or written.
///
/// The first access of a var always records the committed version and value,
/// even when that access is a write. The commit checks that version again
/// before publishing, so every logged var takes part in validation and in
/// blocking on `retry`.
#[derive(Clone)]
pub struct LogVar {
    /// The var itself, needed to lock, validate and publish it.
    pub var: Arc<VarControlBlock>,

    /// Version of the var when it was first accessed.
    pub version: u64,

    /// Value of the var when it was first accessed.
    pub original: ArcAny,

    /// Value visible to the rest of the attempt.
    pub value: ArcAny,

    /// Whether `value` has to be published.
    pub written: bool,
}

impl LogVar {
    /// Log the committed state of `var`.
    pub fn load(var: &Arc<VarControlBlock>) -> LogVar {
        let (version, value) = var.load();
        LogVar {
            var: var.clone(),
            version,
            original: value.clone(),
            value,
            written: false,
        }
    }

    /// Read the current value of the attempt.
    pub fn read(&self) -> ArcAny {
        self.value.clone()
    }

    /// Stage a write, keeping the observed version.
    pub fn write(&mut self, w: ArcAny) {
        self.value = w;
        self.written = true;
    }

    /// Forget a staged write but keep the observation.
    ///
    /// Used for vars touched by an abandoned branch: the write must not be
    /// published, but the branch's decision still depends on what it read.
    pub fn obsolete(self) -> LogVar {
        LogVar {
            value: self.original.clone(),
            written: false,
            ..self
        }
    }

    /// Check if the var is still at the observed version.
    pub fn is_current(&self) -> bool {
        self.var.version() == self.version
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Test if writes are ignored, when a var is set to obsolete.
    #[test]
    fn test_write_obsolete_ignore() {
        let var = VarControlBlock::new(1);
        let mut log = LogVar::load(&var);
        log.write(Arc::new(42));
        assert!(log.written);

        let t = log.obsolete();
        assert!(!t.written);
        assert_eq!(t.read().downcast_ref::<i32>(), Some(&1));
        assert_eq!(t.version, 0);
    }

    #[test]
    fn write_keeps_observed_version() {
        let var = VarControlBlock::new(1);
        let mut log = LogVar::load(&var);
        log.write(Arc::new(2));
        assert_eq!(log.version, 0);
        assert_eq!(log.read().downcast_ref::<i32>(), Some(&2));
        assert!(log.is_current());
    }
}
