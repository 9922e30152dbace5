use indicatif::{ProgressBar, ProgressStyle};
use std::cell::Cell;

/// Progress over one download batch. Lessons skipped from cache do not skew the ETA,
/// and failures are counted on the bar as they happen.
pub struct DownloadProgress {
    bar: Option<ProgressBar>,
    failed: Cell<usize>,
    finished: Cell<bool>,
}

impl DownloadProgress {
    pub fn new(lessons: u64, enabled: bool) -> Self {
        let bar = if enabled {
            let pb = ProgressBar::new(lessons);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} lessons ({eta}) {prefix:.red} {msg}")
                    .expect("Invalid progress bar template")
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            bar,
            failed: Cell::new(0),
            finished: Cell::new(false),
        }
    }

    pub fn hidden() -> Self {
        Self::new(0, false)
    }

    /// One lesson fetched or attempted.
    pub fn inc(&self) {
        if let Some(ref pb) = self.bar {
            pb.inc(1);
        }
    }

    /// One lesson that needed no download. Keeps the ETA based on real downloads only.
    pub fn skip(&self) {
        if let Some(ref pb) = self.bar {
            pb.inc(1);
            pb.reset_eta();
        }
    }

    pub fn record_failure(&self, title: &str) {
        let failed = self.failed.get() + 1;
        self.failed.set(failed);

        if let Some(ref pb) = self.bar {
            pb.set_prefix(format!("{} failed", failed));
            pb.println(format!("✗ {}", title));
        }
    }

    pub fn failed(&self) -> usize {
        self.failed.get()
    }

    pub fn finish(&self) {
        if self.finished.replace(true) {
            return;
        }

        if let Some(ref pb) = self.bar {
            pb.finish_with_message(finish_message(self.failed.get()));
        }
    }

    pub fn set_message(&self, msg: String) {
        if let Some(ref pb) = self.bar {
            pb.set_message(msg);
        }
    }
}

fn finish_message(failed: usize) -> String {
    match failed {
        0 => "✓ Downloads finished".to_string(),
        1 => "Downloads finished, 1 lesson failed".to_string(),
        n => format!("Downloads finished, {} lessons failed", n),
    }
}

impl Drop for DownloadProgress {
    fn drop(&mut self) {
        // Only auto-clear the bar if it was never explicitly finished.
        if !self.finished.get() {
            if let Some(ref pb) = self.bar {
                pb.finish_and_clear();
            }
        }
    }
}
