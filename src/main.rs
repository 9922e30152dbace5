mod cli;
mod progress;
mod runner;
mod signals;

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use browser::ChromeSession;
use cli::{Cli, Commands, RunOptions};
use downloader::YtDlp;
use ledger::Ledger;
use progress::DownloadProgress;
use runner::{ChromeEntry, ExtractSettings, ExtractionReport, Workspace};
use signals::StopSignal;

const LOG_FILE: &str = "course_harvester.log";

fn init_logging(cli: &Cli, logs_dir: &Path) -> Result<()> {
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else if cli.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    let filter = || {
        EnvFilter::from_default_env()
            .add_directive(level.into())
            .add_directive("headless_chrome=warn".parse().expect("valid directive"))
    };

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(LOG_FILE))
        .context("open log file")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file))
                .with_filter(filter()),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

/// Opens the browser only when the ledger cannot answer on its own.
async fn obtain_lessons(
    course_ref: &str,
    ledger: &mut Ledger,
    options: &RunOptions,
    stop: Arc<AtomicBool>,
) -> Result<Option<ExtractionReport>> {
    if !ledger.needs_extraction(options.force) {
        info!("Using {} cached lessons from {:?}", ledger.len(), ledger.path());
        return Ok(None);
    }
    if options.force {
        info!("Forcing re-extraction");
    }
    if options.headless {
        warn!("Headless browser: login and manual navigation are not possible");
    }

    let session = ChromeSession::launch(&options.launch_config())?;
    let page = session.open_page(options.page_config())?;
    let entry = ChromeEntry {
        page: &page,
        frame_selector: options.frame_selector.clone(),
        login_timeout: Duration::from_secs(options.login_timeout_secs),
    };
    let settings = ExtractSettings {
        pattern: options.sniff_pattern(),
        navigator: options.navigator_config(),
        force: options.force,
    };

    let report = runner::extract_lessons(&page, &entry, course_ref, ledger, &settings, stop).await?;
    info!(
        "Lessons captured in {:?} mode ({:?}): {} this run, {} new",
        report.mode, report.ended, report.found, report.added
    );
    Ok(Some(report))
}

async fn run_download(
    course_ref: &str,
    workspace: &Workspace,
    options: &RunOptions,
    stop: &StopSignal,
    show_progress: bool,
) -> Result<bool> {
    info!("=== Course Harvester ===");
    info!("Course: {}", course_ref);
    info!("Output: {:?}", workspace.videos_dir);

    let mut ledger = Ledger::load(workspace.ledger_path())?;
    let extraction = obtain_lessons(course_ref, &mut ledger, options, stop.flag()).await?;
    if ledger.is_empty() {
        return Err(runner::HarvestError::NoLessons.into());
    }

    let config = options.download_config();
    let fetcher = YtDlp::new(config.clone());
    fetcher.check_installed()?;

    let progress = DownloadProgress::new(ledger.len() as u64, show_progress);
    let mut summary = runner::download_pending(
        &mut ledger,
        &fetcher,
        &config,
        &workspace.videos_dir,
        &progress,
        &stop.flag(),
    )?;
    summary.extracted = extraction.map_or(0, |report| report.added);

    summary.log();
    if stop.should_stop() {
        warn!("Run interrupted; run the same command again to resume");
    }
    info!("Videos saved to: {:?}", workspace.videos_dir);
    Ok(summary.succeeded())
}

async fn run_test(
    course_ref: &str,
    workspace: &Workspace,
    options: &RunOptions,
    stop: &StopSignal,
) -> Result<bool> {
    info!("=== Extraction Test ===");
    info!("Course: {}", course_ref);

    let mut ledger = Ledger::load(workspace.ledger_path())?;
    obtain_lessons(course_ref, &mut ledger, options, stop.flag()).await?;
    if ledger.is_empty() {
        return Err(runner::HarvestError::NoLessons.into());
    }

    info!("Extraction successful! Found {} lessons", ledger.len());
    runner::log_listing(&ledger);
    info!("Stream URLs saved to: {:?}", ledger.path());
    Ok(true)
}

async fn run(cli: Cli, workspace: Workspace) -> Result<bool> {
    let stop = StopSignal::new();
    stop.install()?;

    match &cli.command {
        Commands::Download {
            course_ref, options, ..
        } => run_download(course_ref, &workspace, options, &stop, !cli.quiet).await,
        Commands::Test { course_ref, options } => run_test(course_ref, &workspace, options, &stop).await,
    }
}

fn target_dir(command: &Commands) -> Result<PathBuf> {
    match command {
        Commands::Download {
            target_dir: Some(dir), ..
        } => Ok(dir.clone()),
        _ => std::env::current_dir().context("resolve working directory"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let workspace = match target_dir(&cli.command).and_then(|dir| Workspace::create(&dir)) {
        Ok(workspace) => workspace,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&cli, &workspace.logs_dir) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli, workspace).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
