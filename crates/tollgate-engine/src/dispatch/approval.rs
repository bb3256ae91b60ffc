//! Operator confirmation of estimated spend.

use std::io::{self, BufRead, Write};

/// Decides whether a batch whose estimate exceeds the auto-approve ceiling may proceed.
pub trait Approver: Send + Sync {
    /// Returns `true` to proceed.
    ///
    /// May block; the engine calls it off the async runtime.
    fn approve(&self, estimated_cost: f64, uncached: usize) -> bool;
}

/// Asks on stderr and reads one line from stdin. `n` or `no` declines; anything else proceeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinApprover;

impl Approver for StdinApprover {
    fn approve(&self, estimated_cost: f64, uncached: usize) -> bool {
        let mut stderr = io::stderr();
        let _ = write!(
            stderr,
            "Executing {uncached} uncached requests may cost up to ${estimated_cost:.2}. Proceed? [Y/n] "
        );
        let _ = stderr.flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(_) => is_confirmation(&line),
            Err(_) => false,
        }
    }
}

/// Approves everything; for non-interactive runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprover;

impl Approver for AutoApprover {
    fn approve(&self, _estimated_cost: f64, _uncached: usize) -> bool {
        true
    }
}

fn is_confirmation(line: &str) -> bool {
    !matches!(line.trim().to_lowercase().as_str(), "n" | "no")
}
