use browser::{LaunchConfig, PageConfig};
use clap::{Args, Parser, Subcommand};
use downloader::DownloadConfig;
use navigator::NavigatorConfig;
use sniffer::SniffPattern;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "course-harvester")]
#[command(author = "CharaTech")]
#[command(version)]
#[command(about = "Capture lesson video streams from a course player and download them", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract every lesson's stream and download the videos
    Download {
        /// Course URL
        #[arg(value_name = "COURSE")]
        course_ref: String,

        /// Directory that receives downloads/ and logs/
        #[arg(value_name = "TARGET_DIR")]
        target_dir: Option<PathBuf>,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Extract stream URLs only, without downloading
    Test {
        /// Course URL
        #[arg(value_name = "COURSE")]
        course_ref: String,

        #[command(flatten)]
        options: RunOptions,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunOptions {
    /// Re-run extraction even if cached stream URLs exist
    #[arg(long)]
    pub force: bool,

    /// Run the browser without a window (no manual navigation or login possible)
    #[arg(long, env = "COURSE_HARVESTER_HEADLESS")]
    pub headless: bool,

    /// Browser profile directory that keeps the login between runs
    #[arg(long, env = "COURSE_HARVESTER_PROFILE", default_value = ".course_browser_data")]
    pub profile_dir: PathBuf,

    /// How long each automatic step waits for a new lesson stream
    #[arg(long, default_value = "4000")]
    pub step_timeout_ms: u64,

    /// Consecutive steps without a new lesson that end automatic navigation
    #[arg(long, default_value = "3")]
    pub stagnation_threshold: u32,

    /// How long the navigation probe waits for the lesson to change
    #[arg(long, default_value = "5000")]
    pub probe_timeout_ms: u64,

    /// Do not click the player and press Space before giving up on a stalled walk
    #[arg(long)]
    pub no_nudge: bool,

    /// CSS selector of the video player, clicked to regain keyboard focus
    #[arg(long, default_value = r#"video, mux-player, [class*="video"], [class*="player"]"#)]
    pub player_selector: String,

    /// Hard cap on automatic navigation steps
    #[arg(long, default_value = "150")]
    pub max_steps: u32,

    /// Give up on manual navigation after this many seconds
    #[arg(long)]
    pub manual_timeout_secs: Option<u64>,

    /// Login wait limit in seconds
    #[arg(long, default_value = "300")]
    pub login_timeout_secs: u64,

    /// CSS selector of the lesson heading
    #[arg(long, default_value = "h1")]
    pub title_selector: String,

    /// CSS selector of the iframe hosting the course app
    #[arg(
        long,
        default_value = r#"iframe[src*="courses.apps.whop.com"], iframe[src*="/core/app/launch/?redirect="]"#
    )]
    pub frame_selector: String,

    /// Host serving the HLS manifests
    #[arg(long, env = "COURSE_HARVESTER_VENDOR_HOST", default_value = "stream.mux.com")]
    pub vendor_host: String,

    /// Path to yt-dlp
    #[arg(long, env = "COURSE_HARVESTER_DOWNLOADER", default_value = "yt-dlp")]
    pub downloader: PathBuf,
}

impl RunOptions {
    pub fn navigator_config(&self) -> NavigatorConfig {
        NavigatorConfig {
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            stagnation_threshold: self.stagnation_threshold.max(1),
            nudge_on_stall: !self.no_nudge,
            max_steps: self.max_steps,
            manual_timeout: self.manual_timeout_secs.map(Duration::from_secs),
            ..NavigatorConfig::default()
        }
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            headless: self.headless,
            profile_dir: Some(self.profile_dir.clone()),
            ..LaunchConfig::default()
        }
    }

    pub fn page_config(&self) -> PageConfig {
        PageConfig {
            title_selector: self.title_selector.clone(),
            player_selector: self.player_selector.clone(),
            ..PageConfig::default()
        }
    }

    pub fn sniff_pattern(&self) -> SniffPattern {
        SniffPattern {
            host: self.vendor_host.clone(),
            ..SniffPattern::default()
        }
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            program: self.downloader.clone(),
            ..DownloadConfig::default()
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
