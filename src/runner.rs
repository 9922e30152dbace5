use crate::progress::DownloadProgress;
use anyhow::{Context, Result};
use browser::{ChromePage, CoursePage, NavigationOptions};
use downloader::{download_with_retries, ensure_dir, output_path, DownloadConfig, MediaFetcher};
use ledger::Ledger;
use navigator::{EndReason, LessonFeed, NavigationMode, NavigatorConfig};
use sequencer::LessonSequencer;
use sniffer::SniffPattern;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("No lessons were discovered. Make sure a lesson video plays in the browser, then run again with --force")]
    NoLessons,
}

/// Output layout under the target directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub target_dir: PathBuf,
    pub videos_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Workspace {
    pub fn create(target_dir: &Path) -> Result<Self> {
        let workspace = Self {
            target_dir: target_dir.to_path_buf(),
            videos_dir: target_dir.join(ledger::LEDGER_DIR).join("videos"),
            logs_dir: target_dir.join("logs"),
        };
        ensure_dir(&workspace.videos_dir)?;
        ensure_dir(&workspace.logs_dir)?;
        Ok(workspace)
    }

    pub fn ledger_path(&self) -> PathBuf {
        ledger::ledger_path(&self.target_dir)
    }
}

/// Gets a freshly opened page onto the first lesson of the course.
pub(crate) trait CourseEntry {
    async fn enter(&self, course_ref: &str) -> Result<()>;
}

pub struct ChromeEntry<'a> {
    pub page: &'a ChromePage,
    pub frame_selector: String,
    pub login_timeout: Duration,
}

impl CourseEntry for ChromeEntry<'_> {
    async fn enter(&self, course_ref: &str) -> Result<()> {
        let options = NavigationOptions::default();
        let poll = Duration::from_secs(2);

        self.page
            .navigate(course_ref, &options)
            .context("course page unreachable")?;
        self.page.wait_for_login(self.login_timeout, poll).await?;

        if self.page.enter_course_frame(&self.frame_selector, &options)?.is_some() {
            info!("Now at: {}", self.page.current_url()?);
            self.page.wait_for_login(self.login_timeout, poll).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub pattern: SniffPattern,
    pub navigator: NavigatorConfig,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionReport {
    pub mode: NavigationMode,
    pub ended: EndReason,
    /// Distinct lessons observed in this run.
    pub found: usize,
    /// Ledger entries that did not exist before this run.
    pub added: usize,
    pub complete: bool,
}

/// Runs one extraction pass and folds every discovered lesson into the ledger as it appears.
pub(crate) async fn extract_lessons(
    page: &dyn CoursePage,
    entry: &impl CourseEntry,
    course_ref: &str,
    ledger: &mut Ledger,
    settings: &ExtractSettings,
    stop: Arc<AtomicBool>,
) -> Result<ExtractionReport> {
    let force = settings.force;
    ledger.set_course(course_ref);
    ledger.set_extraction_complete(false);
    let derived = ledger.backfill_keys(|url| settings.pattern.extract(url).map(|stream| stream.stream_key));
    if derived > 0 {
        info!("Recovered stream keys for {} cached lessons", derived);
    }
    let sequencer = LessonSequencer::with_known(ledger.known_keys()).reserve_through(ledger.highest_index());

    info!("Starting lesson extraction...");
    let mut added = 0;
    let (report, records) = {
        let live = &mut *ledger;
        let added_live = &mut added;
        let mut feed = LessonFeed::attach(page, settings.pattern.clone(), stop)?
            .with_sequencer(sequencer)
            .on_lesson(move |record| {
                *added_live += live.merge(std::slice::from_ref(record), force).added;
                if let Err(e) = live.save() {
                    warn!("Could not persist lesson #{}: {}", record.index, e);
                }
            });

        entry.enter(course_ref).await?;
        let report = navigator::navigate(&mut feed, &settings.navigator).await?;
        (report, feed.records())
    };

    added += ledger.merge(&records, force).added;
    let complete = match report.state.mode {
        NavigationMode::Automatic => report.ended == EndReason::Exhausted,
        _ => true,
    };
    ledger.set_extraction_complete(complete);
    ledger.save()?;

    if !complete {
        warn!(
            "Extraction stopped early ({:?}); the next run will extract again",
            report.ended
        );
    }
    info!("Extraction complete! Found {} lessons ({} new)", records.len(), added);

    if ledger.is_empty() {
        return Err(HarvestError::NoLessons.into());
    }

    Ok(ExtractionReport {
        mode: report.state.mode,
        ended: report.ended,
        found: records.len(),
        added,
        complete,
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub extracted: usize,
    pub cached_skips: usize,
    pub downloaded: usize,
    pub failed: Vec<(u32, String)>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn log(&self) {
        info!("=== Final Results ===");
        info!("Total lessons: {}", self.total);
        info!("Newly extracted: {}", self.extracted);
        info!("Previously downloaded: {}", self.cached_skips);
        info!("Newly downloaded: {}", self.downloaded);
        info!("Failed: {}", self.failed.len());
        if !self.failed.is_empty() {
            info!("Failed downloads:");
            for (index, title) in &self.failed {
                info!("  - {:03} {}", index, title);
            }
        }
    }
}

/// Hands every lesson that is not yet downloaded to the fetcher, one at a time.
///
/// A failed lesson is recorded and the batch carries on.
pub fn download_pending(
    ledger: &mut Ledger,
    fetcher: &dyn MediaFetcher,
    config: &DownloadConfig,
    videos_dir: &Path,
    progress: &DownloadProgress,
    stop: &AtomicBool,
) -> Result<RunSummary> {
    let lessons: Vec<(u32, Option<String>, bool)> = ledger
        .entries()
        .map(|(index, entry)| (index, entry.stream_url.clone(), entry.downloaded))
        .collect();

    let mut summary = RunSummary {
        total: lessons.len(),
        ..RunSummary::default()
    };
    let pending = lessons.iter().filter(|(_, _, done)| !done).count();
    info!("=== Download Summary ===");
    info!("Total lessons: {}", summary.total);
    info!("Already downloaded: {}", summary.total - pending);
    info!("To download: {}", pending);

    for (index, url, already) in lessons {
        if stop.load(Ordering::SeqCst) {
            warn!("Stop requested, leaving remaining lessons for the next run");
            break;
        }

        let title = ledger.title_for(index);
        if already {
            summary.cached_skips += 1;
            progress.skip();
            continue;
        }

        let output = output_path(videos_dir, index, &title);
        if output.exists() {
            info!("[{}/{}] Already on disk: {}", index, summary.total, title);
            ledger.mark_downloaded(index)?;
            summary.cached_skips += 1;
            progress.skip();
            continue;
        }

        let Some(url) = url else {
            warn!("[{}/{}] No stream URL for {}", index, summary.total, title);
            progress.record_failure(&title);
            summary.failed.push((index, title));
            progress.inc();
            continue;
        };

        progress.set_message(title.clone());
        info!("[{}/{}] Downloading: {}", index, summary.total, title);
        match download_with_retries(fetcher, config, &url, &output) {
            Ok(attempt) => {
                ledger.mark_downloaded(index)?;
                summary.downloaded += 1;
                info!("[{}/{}] ✓ Downloaded ({}): {}", index, summary.total, attempt, title);
            }
            Err(e) => {
                error!("[{}/{}] ✗ {}: {}", index, summary.total, title, e);
                progress.record_failure(&title);
                summary.failed.push((index, title));
            }
        }
        progress.inc();

        if config.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(config.delay_ms));
        }
    }

    progress.finish();
    Ok(summary)
}

/// First and last few lessons, for eyeballing an extraction.
pub fn log_listing(ledger: &Ledger) {
    let entries: Vec<_> = ledger.entries().collect();
    let describe = |(index, entry): &(u32, &ledger::LedgerEntry)| {
        info!(
            "  {}. {} - ID: {}",
            index,
            ledger.title_for(*index),
            entry.stream_key.as_deref().unwrap_or("?")
        );
    };

    info!("First 5 lessons:");
    entries.iter().take(5).for_each(describe);
    if entries.len() > 10 {
        info!("Last 5 lessons:");
        entries[entries.len() - 5..].iter().for_each(describe);
    }
}
