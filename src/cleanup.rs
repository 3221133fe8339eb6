//! Registry of teardown actions shared by every flow of a run.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

type Action = Box<dyn FnOnce() -> Result<(), String> + Send>;

struct Entry {
    label: String,
    action: Action,
}

/// Concurrency-safe list of cleanup actions. Cloning shares the same list.
///
/// Any flow may append; [`drain`](Self::drain) runs each action exactly once.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

/// Outcome of draining the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub executed: usize,
    pub failed: usize,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(Entry {
            label: label.into(),
            action: Box::new(action),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every registered action once, in registration order. Failures
    /// and panics are logged and swallowed so the remaining actions still run.
    pub fn drain(&self) -> CleanupSummary {
        let entries = {
            let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        let mut summary = CleanupSummary::default();
        for Entry { label, action } in entries {
            summary.executed += 1;
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)) {
                Ok(Ok(())) => debug!(action = %label, "Cleanup action completed"),
                Ok(Err(reason)) => {
                    summary.failed += 1;
                    warn!(action = %label, error = %reason, "Cleanup action failed");
                }
                Err(_) => {
                    summary.failed += 1;
                    warn!(action = %label, "Cleanup action panicked");
                }
            }
        }
        summary
    }
}
