//! Process lifecycle tracking for readiness reporting.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Lifecycle phase of the exporter process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Running => "running",
            Lifecycle::ShuttingDown => "shutting_down",
            Lifecycle::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, forward-only lifecycle cell.
#[derive(Debug, Clone)]
pub struct LifecycleState {
    inner: Arc<RwLock<Lifecycle>>,
}

impl LifecycleState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Lifecycle::Uninitialized)),
        }
    }

    /// Current phase.
    pub fn current(&self) -> Lifecycle {
        *self.inner.read()
    }

    /// Move to `next`. Returns `false` and leaves the phase unchanged if
    /// `next` is not strictly later than the current phase.
    pub fn advance(&self, next: Lifecycle) -> bool {
        let mut current = self.inner.write();
        if next <= *current {
            warn!(from = %*current, to = %next, "Rejected lifecycle transition");
            return false;
        }
        debug!(from = %*current, to = %next, "Lifecycle transition");
        *current = next;
        true
    }

    pub fn is_running(&self) -> bool {
        self.current() == Lifecycle::Running
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}
