//! Terminal progress bar over catalog terms.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use harvester_core::pipeline::RunObserver;
use harvester_core::{ManifestRecord, ManifestStatus, SearchTerm};
use indicatif::{ProgressBar, ProgressStyle};

/// Bar advanced once per term; the message shows the running saved count.
#[derive(Debug)]
pub(crate) struct TermProgress {
    bar: ProgressBar,
    saved: AtomicUsize,
    processed: AtomicUsize,
}

impl TermProgress {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self {
            bar,
            saved: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn refresh(&self, label: &str) {
        self.bar.set_message(format!(
            "{label} ({} saved / {} processed)",
            self.saved.load(Ordering::SeqCst),
            self.processed.load(Ordering::SeqCst)
        ));
    }
}

impl RunObserver for TermProgress {
    fn run_started(&self, terms: usize) {
        self.bar.set_length(terms as u64);
    }

    fn term_started(&self, index: usize, term: &SearchTerm) {
        self.bar.set_position(index as u64);
        self.refresh(&format!("{}: {}", term.category, term.term));
    }

    fn candidate_finished(&self, record: &ManifestRecord) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if record.status == ManifestStatus::Saved {
            self.saved.fetch_add(1, Ordering::SeqCst);
        }
        self.bar.tick();
    }
}
