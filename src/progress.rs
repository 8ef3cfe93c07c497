//! Progress counters shared by concurrent transfers.
//!
//! Workers report byte and item deltas through [`Progress`], which keeps
//! running totals in atomics and forwards each event to a [`ProgressSink`].
//! Sinks only observe; nothing they do affects scheduling.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One progress update.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent<'a> {
    pub bytes_delta: u64,
    pub items_delta: usize,
    pub description: &'a str,
}

/// Receives progress updates.
pub trait ProgressSink: Send + Sync {
    fn record(&self, event: &ProgressEvent<'_>, totals: ProgressTotals);

    /// Called once before the first transfer with the size of the work set.
    fn start(&self, _total_items: usize, _total_bytes: u64) {}

    /// Called once when the run is over.
    fn finish(&self, _message: &str) {}
}

/// Running totals after an event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressTotals {
    pub bytes: u64,
    pub items: usize,
    pub total_items: usize,
}

/// Shared running totals.
pub struct Progress {
    bytes: AtomicU64,
    items: AtomicUsize,
    total_items: usize,
    sink: Arc<dyn ProgressSink>,
}

impl Progress {
    pub fn new(total_items: usize, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            bytes: AtomicU64::new(0),
            items: AtomicUsize::new(0),
            total_items,
            sink,
        }
    }

    /// Records bytes streamed for `description`.
    pub fn advance_bytes(&self, delta: u64, description: &str) {
        let bytes = self.bytes.fetch_add(delta, Ordering::Relaxed) + delta;
        self.sink.record(
            &ProgressEvent {
                bytes_delta: delta,
                items_delta: 0,
                description,
            },
            ProgressTotals {
                bytes,
                items: self.items.load(Ordering::Relaxed),
                total_items: self.total_items,
            },
        );
    }

    /// Records that one item finished, successfully or not.
    pub fn complete_item(&self, description: &str) {
        let items = self.items.fetch_add(1, Ordering::Relaxed) + 1;
        self.sink.record(
            &ProgressEvent {
                bytes_delta: 0,
                items_delta: 1,
                description,
            },
            ProgressTotals {
                bytes: self.bytes.load(Ordering::Relaxed),
                items,
                total_items: self.total_items,
            },
        );
    }

    pub fn totals(&self) -> ProgressTotals {
        ProgressTotals {
            bytes: self.bytes.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
            total_items: self.total_items,
        }
    }

    pub fn finish(&self, message: &str) {
        self.sink.finish(message);
    }
}

/// Discards every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn record(&self, _event: &ProgressEvent<'_>, _totals: ProgressTotals) {}
}

/// Logs completed items at debug level.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn record(&self, event: &ProgressEvent<'_>, totals: ProgressTotals) {
        if event.items_delta > 0 {
            debug!(
                "[{}/{}] {} ({} bytes so far)",
                totals.items, totals.total_items, event.description, totals.bytes
            );
        }
    }

    fn start(&self, total_items: usize, total_bytes: u64) {
        debug!("Starting {} transfers ({} bytes)", total_items, total_bytes);
    }

    fn finish(&self, message: &str) {
        debug!("{}", message);
    }
}

/// A byte-based terminal progress bar with an item counter.
pub struct BarProgress {
    pb: indicatif::ProgressBar,
}

impl BarProgress {
    /// Creates a bar that is sized when the work set is known. When stderr is
    /// not a terminal the bar is hidden.
    pub fn new() -> Self {
        let pb = if atty::is(atty::Stream::Stderr) {
            indicatif::ProgressBar::new(0)
        } else {
            indicatif::ProgressBar::hidden()
        };
        let style = indicatif::ProgressStyle::default_bar()
            .template(
                "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {binary_bytes_per_sec} | {msg} | ETA {eta_precise}",
            )
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("█▓▒░ ");
        pb.set_style(style);
        Self { pb }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarProgress {
    fn start(&self, total_items: usize, total_bytes: u64) {
        self.pb.set_length(total_bytes);
        self.pb.set_message(format!("sigs: 0/{}", total_items));
    }

    fn record(&self, event: &ProgressEvent<'_>, totals: ProgressTotals) {
        if event.bytes_delta > 0 {
            self.pb.inc(event.bytes_delta);
        }
        if event.items_delta > 0 {
            self.pb.set_message(format!(
                "sigs: {}/{} {}",
                totals.items, totals.total_items, event.description
            ));
        }
    }

    fn finish(&self, message: &str) {
        self.pb.finish_with_message(message.to_string());
    }
}
