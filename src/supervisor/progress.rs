use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Reports how far the node setup has come.
pub trait Progress: Send + Sync {
    fn increase_step(&self, label: &str);

    /// Setup is over; later steps are not reported.
    fn hide(&self);
}

/// Writes each step to the log as `step/total`.
#[derive(Debug)]
pub struct LogProgress {
    total: usize,
    current: AtomicUsize,
    hidden: AtomicBool,
}

impl LogProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            current: AtomicUsize::new(0),
            hidden: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }
}

impl Progress for LogProgress {
    fn increase_step(&self, label: &str) {
        let step = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        if self.is_hidden() {
            return;
        }
        tracing::info!(step, total = self.total, label, "Progress");
    }

    fn hide(&self) {
        if !self.hidden.swap(true, Ordering::SeqCst) {
            tracing::debug!(steps = self.current(), total = self.total, "Progress hidden");
        }
    }
}
