//! Defer-style cleanup stack.
//!
//! Each resource acquisition pushes a teardown callable. The stack runs in
//! reverse order when [`CleanupStack::run`] is called or when it is dropped,
//! including during unwinding. Teardown failures are logged and collected;
//! they never replace the caller's primary error.

use stevedore_shared::errors::{StevedoreError, StevedoreResult};

type Teardown = Box<dyn FnOnce() -> StevedoreResult<()> + Send>;

#[derive(Default)]
pub struct CleanupStack {
    entries: Vec<(String, Teardown)>,
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field(
                "entries",
                &self.entries.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown. `name` appears in log messages.
    pub fn push<F>(&mut self, name: impl Into<String>, teardown: F)
    where
        F: FnOnce() -> StevedoreResult<()> + Send + 'static,
    {
        self.entries.push((name.into(), Box::new(teardown)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every teardown, most recent first. Returns the failures.
    pub fn run(&mut self) -> Vec<StevedoreError> {
        let mut errors = Vec::new();
        while let Some((name, teardown)) = self.entries.pop() {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(teardown)) {
                Ok(Ok(())) => tracing::trace!(step = %name, "Cleanup step done"),
                Ok(Err(e)) => {
                    tracing::warn!(step = %name, error = %e, "Cleanup step failed");
                    errors.push(e);
                }
                Err(_) => {
                    tracing::warn!(step = %name, "Cleanup step panicked");
                    errors.push(StevedoreError::Internal(format!(
                        "cleanup step {} panicked",
                        name
                    )));
                }
            }
        }
        errors
    }

    /// Move all entries of `other` on top of this stack.
    pub fn absorb(&mut self, mut other: CleanupStack) {
        self.entries.append(&mut other.entries);
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            let _ = self.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for i in 0..3 {
            let order = order.clone();
            stack.push(format!("step-{}", i), move || {
                order.lock().push(i);
                Ok(())
            });
        }
        assert!(stack.run().is_empty());
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_errors_do_not_stop_later_steps() {
        let ran = Arc::new(Mutex::new(false));
        let mut stack = CleanupStack::new();
        {
            let ran = ran.clone();
            stack.push("last", move || {
                *ran.lock() = true;
                Ok(())
            });
        }
        stack.push("failing", || Err(StevedoreError::Storage("boom".into())));
        let errors = stack.run();
        assert_eq!(errors.len(), 1);
        assert!(*ran.lock());
    }

    #[test]
    fn test_drop_runs_pending_steps() {
        let ran = Arc::new(Mutex::new(0));
        {
            let mut stack = CleanupStack::new();
            let ran = ran.clone();
            stack.push("count", move || {
                *ran.lock() += 1;
                Ok(())
            });
        }
        assert_eq!(*ran.lock(), 1);
    }

    #[test]
    fn test_runs_during_unwind() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut stack = CleanupStack::new();
            stack.push("flag", move || {
                *flag.lock() = true;
                Ok(())
            });
            panic!("operation failed");
        }));
        assert!(result.is_err());
        assert!(*ran.lock());
    }

    #[test]
    fn test_panicking_step_is_contained() {
        let mut stack = CleanupStack::new();
        stack.push("panics", || panic!("bad teardown"));
        let errors = stack.run();
        assert_eq!(errors.len(), 1);
    }
}
