use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Grant of continued execution while the app is backgrounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BudgetToken(pub u64);

/// The host runtime that may suspend the process in the background.
pub trait ExecutionHost: Send + Sync {
    /// Ask for extra execution time. `None` when the host refuses.
    fn begin_background_budget(&self) -> Option<BudgetToken>;

    fn end_background_budget(&self, token: BudgetToken);
}

/// Host that never grants background time, e.g. a CLI process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl ExecutionHost for NoopHost {
    fn begin_background_budget(&self) -> Option<BudgetToken> {
        None
    }

    fn end_background_budget(&self, _token: BudgetToken) {}
}

/// Host that grants every request and remembers which grants are open.
#[derive(Debug, Default)]
pub struct RecordingHost {
    next: AtomicU64,
    open: Mutex<Vec<BudgetToken>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_budgets(&self) -> Vec<BudgetToken> {
        self.open.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ExecutionHost for RecordingHost {
    fn begin_background_budget(&self) -> Option<BudgetToken> {
        let token = BudgetToken(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(token);
        Some(token)
    }

    fn end_background_budget(&self, token: BudgetToken) {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|t| *t != token);
    }
}
