//! Terminal progress rendering.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tollgate_engine::{Approver, ProgressObserver, ProgressSnapshot};

/// Renders engine progress as an indicatif bar on stderr.
pub struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    /// A bar for `total` requests.
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        Self { bar }
    }

    /// Removes the bar from the terminal.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    /// Wraps `inner` so that the bar is hidden while it prompts.
    pub fn suspending(&self, inner: Arc<dyn Approver>) -> SuspendingApprover {
        SuspendingApprover { bar: self.bar.clone(), inner }
    }
}

/// An approver that clears the progress bar for the duration of the prompt.
pub struct SuspendingApprover {
    bar: ProgressBar,
    inner: Arc<dyn Approver>,
}

impl Approver for SuspendingApprover {
    fn approve(&self, estimated_cost: f64, uncached: usize) -> bool {
        self.bar.suspend(|| self.inner.approve(estimated_cost, uncached))
    }
}

impl ProgressObserver for BarObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_position(snapshot.completed as u64);
        self.bar.set_message(snapshot.to_string());
    }
}
