//! Progress reporting.
//!
//! Adapters report named phases through the narrow [`Progress`] trait. The
//! console implementation draws indicatif bars on stderr; the no-op
//! implementation is used whenever output must stay machine-readable.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// Synchronous progress sink.
pub trait Progress: Send + Sync {
    /// A phase started. `total` is the expected item count, when known.
    fn phase_started(&self, phase: &str, total: Option<u64>);

    /// `delta` more items of the phase are done.
    fn phase_advanced(&self, phase: &str, delta: u64);

    /// The phase finished.
    fn phase_finished(&self, phase: &str);
}

/// Discards all progress events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl Progress for NoopProgress {
    fn phase_started(&self, _phase: &str, _total: Option<u64>) {}

    fn phase_advanced(&self, _phase: &str, _delta: u64) {}

    fn phase_finished(&self, _phase: &str) {}
}

/// Incremental human-readable progress on stderr.
#[derive(Default)]
pub struct ConsoleProgress {
    current: Mutex<Option<(String, ProgressBar)>>,
}

impl ConsoleProgress {
    /// Creates a console progress sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Progress for ConsoleProgress {
    fn phase_started(&self, phase: &str, total: Option<u64>) {
        let Ok(mut current) = self.current.lock() else {
            return;
        };
        if let Some((_, bar)) = current.take() {
            bar.finish_and_clear();
        }
        let bar = create_progress_bar(total.unwrap_or(0));
        bar.set_message(phase.to_string());
        *current = Some((phase.to_string(), bar));
    }

    fn phase_advanced(&self, phase: &str, delta: u64) {
        let Ok(current) = self.current.lock() else {
            return;
        };
        if let Some((name, bar)) = current.as_ref() {
            if name == phase {
                bar.inc(delta);
            }
        }
    }

    fn phase_finished(&self, phase: &str) {
        let Ok(mut current) = self.current.lock() else {
            return;
        };
        if current.as_ref().is_some_and(|(name, _)| name == phase) {
            if let Some((name, bar)) = current.take() {
                bar.finish_with_message(format!("{name} done"));
            }
        }
    }
}

fn create_progress_bar(total: u64) -> ProgressBar {
    if total == 0 {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg} {pos}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        return pb;
    }

    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] {msg:<14} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}
