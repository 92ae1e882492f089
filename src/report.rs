use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

/// Final figures of a produce or consume run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunResult {
    pub messages_processed: u64,
    pub elapsed: Duration,
    /// Messages per second, 0 when no time elapsed.
    pub rate: f64,
}

impl RunResult {
    pub fn new(messages_processed: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            messages_processed as f64 / secs
        } else {
            0.0
        };
        Self {
            messages_processed,
            elapsed,
            rate,
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} messages in {:.2?} ({:.0} msg/s)",
            self.messages_processed, self.elapsed, self.rate
        )
    }
}

/// One progress observation: `processed` out of `total` after `elapsed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
    pub elapsed: Duration,
}

/// Wall-clock timing and periodic progress lines. Shared by reference between
/// producer workers; never influences control flow.
#[derive(Debug)]
pub struct ThroughputReporter {
    verb: &'static str,
    total: u64,
    interval: u64,
    start: Instant,
    bar: ProgressBar,
}

impl ThroughputReporter {
    pub fn new(verb: &'static str, total: u64, interval: u64) -> Self {
        Self {
            verb,
            total,
            interval,
            start: Instant::now(),
            bar: ProgressBar::hidden(),
        }
    }

    /// Also draw an interactive bar on stderr. Unbounded runs get a spinner.
    pub fn with_progress_bar(mut self) -> Self {
        let bar = if self.total > 0 {
            ProgressBar::new(self.total)
        } else {
            ProgressBar::new_spinner()
        };
        if let Ok(style) = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({per_sec}, {eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("##-"));
        }
        bar.set_message(self.verb);
        self.bar = bar;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Records one more message. `processed` is the 1-based position used for
    /// the interval check; returns the observation when a line was emitted.
    pub fn observe(&self, processed: u64, worker: Option<usize>) -> Option<Progress> {
        self.bar.inc(1);
        if self.interval == 0 || processed % self.interval != 0 {
            return None;
        }
        let progress = Progress {
            processed,
            total: self.total,
            elapsed: self.elapsed(),
        };
        match worker {
            Some(worker) => info!(
                "worker {} {} {}/{} ({:.2?})",
                worker, self.verb, progress.processed, progress.total, progress.elapsed
            ),
            None => info!(
                "{} {}/{} ({:.2?})",
                self.verb, progress.processed, progress.total, progress.elapsed
            ),
        }
        Some(progress)
    }

    pub fn finish(&self, processed: u64) -> RunResult {
        let result = RunResult::new(processed, self.elapsed());
        self.bar.finish_with_message(format!("{} done", self.verb));
        info!("{} {}", self.verb, result);
        result
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}
