use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Downloader not found: {0}")]
    NotInstalled(String),
    #[error("All {attempts} download attempts failed: {last}")]
    AttemptsExhausted { attempts: usize, last: String },
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One way of asking the downloader for a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatAttempt {
    /// `-f <selector>`
    Selector(String),
    /// No format selection, merge whatever comes back into mp4.
    MergeMp4,
}

impl std::fmt::Display for FormatAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatAttempt::Selector(selector) => write!(f, "{}", selector),
            FormatAttempt::MergeMp4 => write!(f, "merge-to-mp4 fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded,
    /// The stream exists but does not offer the requested format.
    FormatUnavailable,
    Failed(String),
}

pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub output: &'a Path,
    pub attempt: &'a FormatAttempt,
}

/// The external media retriever. One call is one attempt.
pub trait MediaFetcher {
    fn fetch(&self, request: &FetchRequest<'_>) -> FetchOutcome;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub program: PathBuf,
    /// Tried in order until one succeeds.
    pub formats: Vec<String>,
    /// Final attempt without a format selector.
    pub merge_fallback: bool,
    pub referer: Option<String>,
    pub user_agent: String,
    pub concurrent_fragments: u32,
    pub delay_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            formats: vec![
                "best[ext=mp4]/best".to_string(),
                "best".to_string(),
                "bestvideo+bestaudio/best".to_string(),
                "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string(),
                "bestvideo*+bestaudio/best".to_string(),
            ],
            merge_fallback: true,
            referer: Some("https://whop.com/".to_string()),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            concurrent_fragments: 4,
            delay_ms: 1000,
        }
    }
}

impl DownloadConfig {
    pub fn attempts(&self) -> Vec<FormatAttempt> {
        let mut attempts: Vec<FormatAttempt> = self
            .formats
            .iter()
            .map(|f| FormatAttempt::Selector(f.clone()))
            .collect();
        if self.merge_fallback {
            attempts.push(FormatAttempt::MergeMp4);
        }
        attempts
    }
}

/// `yt-dlp` as a subprocess.
pub struct YtDlp {
    config: DownloadConfig,
}

impl YtDlp {
    pub fn new(config: DownloadConfig) -> Self {
        Self { config }
    }

    pub fn check_installed(&self) -> Result<(), DownloadError> {
        Command::new(&self.config.program)
            .arg("--version")
            .output()
            .map_err(|e| {
                DownloadError::NotInstalled(format!(
                    "{} ({}). Install yt-dlp or pass --downloader",
                    self.config.program.display(),
                    e
                ))
            })?;
        Ok(())
    }
}

pub fn build_args(config: &DownloadConfig, request: &FetchRequest<'_>) -> Vec<String> {
    let mut args = vec![
        "--no-warnings".to_string(),
        "--quiet".to_string(),
        "--progress".to_string(),
        "--no-check-certificate".to_string(),
    ];
    if let Some(referer) = &config.referer {
        args.push("--referer".to_string());
        args.push(referer.clone());
    }
    args.push("--user-agent".to_string());
    args.push(config.user_agent.clone());

    match request.attempt {
        FormatAttempt::Selector(selector) => {
            args.push("-f".to_string());
            args.push(selector.clone());
        }
        FormatAttempt::MergeMp4 => {
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
    }

    if request.url.contains(".m3u8") {
        args.push("--concurrent-fragments".to_string());
        args.push(config.concurrent_fragments.to_string());
    }

    args.push("-o".to_string());
    args.push(request.output.to_string_lossy().into_owned());
    args.push(request.url.to_string());
    args
}

impl MediaFetcher for YtDlp {
    fn fetch(&self, request: &FetchRequest<'_>) -> FetchOutcome {
        let output = match Command::new(&self.config.program)
            .args(build_args(&self.config, request))
            .output()
        {
            Ok(output) => output,
            Err(e) => return FetchOutcome::Failed(format!("failed to run downloader: {}", e)),
        };

        if output.status.success() {
            return FetchOutcome::Downloaded;
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        classify_failure(&stderr)
    }
}

pub fn classify_failure(stderr: &str) -> FetchOutcome {
    if stderr.contains("Requested format is not available") {
        FetchOutcome::FormatUnavailable
    } else {
        FetchOutcome::Failed(stderr.trim().to_string())
    }
}

/// Runs every configured attempt for one lesson until one succeeds.
///
/// Returns the attempt that worked.
pub fn download_with_retries(
    fetcher: &dyn MediaFetcher,
    config: &DownloadConfig,
    url: &str,
    output: &Path,
) -> Result<FormatAttempt, DownloadError> {
    let attempts = config.attempts();
    let mut last = String::from("no attempts configured");

    for attempt in &attempts {
        let request = FetchRequest {
            url,
            output,
            attempt,
        };
        match fetcher.fetch(&request) {
            FetchOutcome::Downloaded => return Ok(attempt.clone()),
            FetchOutcome::FormatUnavailable => {
                debug!("Format '{}' not available, trying next", attempt);
                last = format!("format '{}' not available", attempt);
            }
            FetchOutcome::Failed(reason) => {
                warn!("Attempt with '{}' failed: {}", attempt, reason);
                last = reason;
            }
        }
    }

    error!("✗ Failed all download attempts for {:?}", output);
    Err(DownloadError::AttemptsExhausted {
        attempts: attempts.len(),
        last,
    })
}

/// Keeps alphanumerics, space, `-` and `_`, then swaps spaces for underscores.
pub fn safe_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    kept.trim_end().replace(' ', "_")
}

pub fn output_path(videos_dir: &Path, index: u32, title: &str) -> PathBuf {
    videos_dir.join(format!("{:03}_{}.mp4", index, safe_title(title)))
}

pub fn ensure_dir(dir: &Path) -> Result<(), DownloadError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        info!("Created {:?}", dir);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Scripted {
        outcomes: RefCell<Vec<FetchOutcome>>,
        seen: RefCell<Vec<FormatAttempt>>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<FetchOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: RefCell::new(outcomes),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl MediaFetcher for Scripted {
        fn fetch(&self, request: &FetchRequest<'_>) -> FetchOutcome {
            self.seen.borrow_mut().push(request.attempt.clone());
            self.outcomes
                .borrow_mut()
                .pop()
                .unwrap_or(FetchOutcome::Failed("exhausted".to_string()))
        }
    }

    #[test]
    fn test_default_attempts() {
        let attempts = DownloadConfig::default().attempts();
        assert_eq!(attempts.len(), 6);
        assert_eq!(attempts[0], FormatAttempt::Selector("best[ext=mp4]/best".to_string()));
        assert_eq!(attempts[5], FormatAttempt::MergeMp4);
    }

    #[test]
    fn test_retries_with_next_format() {
        let fetcher = Scripted::new(vec![
            FetchOutcome::FormatUnavailable,
            FetchOutcome::Failed("HTTP Error 403".to_string()),
            FetchOutcome::Downloaded,
        ]);
        let config = DownloadConfig::default();
        let used = download_with_retries(&fetcher, &config, "https://stream.mux.com/a.m3u8", Path::new("/tmp/a.mp4")).unwrap();

        assert_eq!(used, FormatAttempt::Selector("bestvideo+bestaudio/best".to_string()));
        assert_eq!(fetcher.seen.borrow().len(), 3);
    }

    #[test]
    fn test_gives_up_after_fallback() {
        let fetcher = Scripted::new(vec![]);
        let config = DownloadConfig {
            formats: vec!["best".to_string()],
            ..DownloadConfig::default()
        };
        let err = download_with_retries(&fetcher, &config, "u", Path::new("/tmp/a.mp4")).unwrap_err();

        assert!(matches!(err, DownloadError::AttemptsExhausted { attempts: 2, .. }));
        assert_eq!(*fetcher.seen.borrow(), vec![FormatAttempt::Selector("best".to_string()), FormatAttempt::MergeMp4]);
    }

    #[test]
    fn test_build_args_for_hls() {
        let config = DownloadConfig::default();
        let attempt = FormatAttempt::Selector("best".to_string());
        let request = FetchRequest {
            url: "https://stream.mux.com/a.m3u8?token=t",
            output: Path::new("out/001_Intro.mp4"),
            attempt: &attempt,
        };
        let args = build_args(&config, &request);

        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "best"));
        assert!(args.windows(2).any(|w| w[0] == "--concurrent-fragments" && w[1] == "4"));
        assert!(args.windows(2).any(|w| w[0] == "--referer" && w[1] == "https://whop.com/"));
        assert_eq!(args.last().unwrap(), "https://stream.mux.com/a.m3u8?token=t");
    }

    #[test]
    fn test_build_args_merge_fallback() {
        let config = DownloadConfig {
            referer: None,
            ..DownloadConfig::default()
        };
        let request = FetchRequest {
            url: "https://example.com/video.mp4",
            output: Path::new("x.mp4"),
            attempt: &FormatAttempt::MergeMp4,
        };
        let args = build_args(&config, &request);

        assert!(!args.contains(&"-f".to_string()));
        assert!(!args.contains(&"--referer".to_string()));
        assert!(!args.contains(&"--concurrent-fragments".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--merge-output-format" && w[1] == "mp4"));
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("ERROR: [generic] x: Requested format is not available. Use --list-formats"),
            FetchOutcome::FormatUnavailable
        );
        assert_eq!(
            classify_failure("ERROR: HTTP Error 403: Forbidden\n"),
            FetchOutcome::Failed("ERROR: HTTP Error 403: Forbidden".to_string())
        );
    }

    #[test]
    fn test_output_naming() {
        assert_eq!(safe_title("Intro: Getting Started!"), "Intro_Getting_Started");
        assert_eq!(safe_title("Lesson_7  "), "Lesson_7");
        assert_eq!(
            output_path(Path::new("videos"), 7, "Risk & Reward"),
            Path::new("videos").join("007_Risk__Reward.mp4")
        );
    }
}
