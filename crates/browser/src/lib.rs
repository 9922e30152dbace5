use anyhow::Result;
use headless_chrome::Browser as ChromeBrowser;
use headless_chrome::{LaunchOptions, Tab};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),
    #[error("Navigation error: {0}")]
    NavigationError(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Page closed")]
    PageClosed,
    #[error("Browser error: {0}")]
    BrowserError(#[from] anyhow::Error),
}

/// Callback invoked with the URL of every network request the page makes.
///
/// Runs on the browser library's event thread, so it must return quickly.
pub type RequestListener = Box<dyn Fn(&str) + Send + Sync>;

/// The slice of a live, logged-in course page the extraction core needs.
pub trait CoursePage: Send + Sync {
    /// Subscribe to the page's network traffic.
    fn watch_requests(&self, listener: RequestListener) -> Result<(), BrowserError>;

    /// Dispatch a single "next lesson" input event.
    fn advance(&self) -> Result<(), BrowserError>;

    /// Give the player focus and send the alternate key, for when `advance` stops landing.
    fn nudge(&self) -> Result<(), BrowserError>;

    /// Visible lesson title, if the page currently shows one.
    fn lesson_title(&self) -> Result<Option<String>, BrowserError>;

    fn current_url(&self) -> Result<String, BrowserError>;

    /// True once the operator has closed the page or the browser.
    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub headless: bool,
    /// Persistent profile so the login survives between runs.
    pub profile_dir: Option<PathBuf>,
    pub window_size: (u32, u32),
    pub idle_timeout_secs: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: false,
            profile_dir: None,
            window_size: (1920, 1080),
            idle_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageConfig {
    pub advance_key: String,
    pub title_selector: String,
    /// Clicked by [`CoursePage::nudge`] to pull keyboard focus back to the player.
    pub player_selector: String,
    pub nudge_key: String,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            advance_key: "ArrowRight".to_string(),
            title_selector: "h1".to_string(),
            player_selector: r#"video, mux-player, [class*="video"], [class*="player"]"#.to_string(),
            nudge_key: " ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationOptions {
    pub timeout_ms: u64,
    pub wait_for_idle: bool,
    /// Extra pause after load so the player can start requesting media.
    pub settle_ms: u64,
}

impl Default for NavigationOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 60000,
            wait_for_idle: true,
            settle_ms: 3000,
        }
    }
}

/// Owns the browser process for the length of one run. Dropping it closes Chrome.
pub struct ChromeSession {
    browser: ChromeBrowser,
}

impl ChromeSession {
    pub fn launch(config: &LaunchConfig) -> Result<Self, BrowserError> {
        if let Some(dir) = &config.profile_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| BrowserError::LaunchFailed(format!("profile dir {:?}: {}", dir, e)))?;
        }

        let launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .window_size(Some(config.window_size))
            .user_data_dir(config.profile_dir.clone())
            .idle_browser_timeout(Duration::from_secs(config.idle_timeout_secs))
            .args(vec![
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-features=IsolateOrigins,site-per-process"),
            ])
            .build()
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        let browser = ChromeBrowser::new(launch_options)
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        info!(headless = config.headless, "Browser launched successfully");
        Ok(Self { browser })
    }

    pub fn open_page(&self, config: PageConfig) -> Result<ChromePage, BrowserError> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| BrowserError::BrowserError(anyhow::anyhow!(e.to_string())))?;
        Ok(ChromePage { tab, config })
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
    config: PageConfig,
}

impl ChromePage {
    pub fn navigate(&self, url: &str, options: &NavigationOptions) -> Result<(), BrowserError> {
        info!("Navigating to: {}", url);

        self.tab.set_default_timeout(Duration::from_millis(options.timeout_ms));
        self.tab
            .navigate_to(url)
            .map_err(|e| BrowserError::NavigationError(e.to_string()))?;

        if options.wait_for_idle {
            self.tab
                .wait_until_navigated()
                .map_err(|e| BrowserError::NavigationError(e.to_string()))?;
        }

        std::thread::sleep(Duration::from_millis(options.settle_ms));
        debug!("Navigation complete");
        Ok(())
    }

    /// Moves the page into the embedded course app, if the landing page wraps it in an iframe.
    ///
    /// Returns the frame URL that was entered, or `None` when no matching iframe exists.
    pub fn enter_course_frame(
        &self,
        frame_selector: &str,
        options: &NavigationOptions,
    ) -> Result<Option<String>, BrowserError> {
        let script = format!(
            "(() => {{ const f = document.querySelector({}); return f ? f.getAttribute('src') : null; }})()",
            js_string(frame_selector)
        );
        let src = match self.evaluate(&script)? {
            serde_json::Value::String(src) if !src.is_empty() => src,
            _ => {
                debug!("No course iframe on {}", self.tab.get_url());
                return Ok(None);
            }
        };

        let frame_url = absolutize(&self.tab.get_url(), &src)
            .ok_or_else(|| BrowserError::NavigationError(format!("bad iframe src: {}", src)))?;
        info!("Found course iframe: {}", truncate(&frame_url, 100));
        self.navigate(&frame_url, options)?;
        Ok(Some(frame_url))
    }

    /// Blocks until the page leaves the login screen, or fails after `max_wait`.
    pub async fn wait_for_login(&self, max_wait: Duration, poll: Duration) -> Result<(), BrowserError> {
        if !is_login_url(&self.tab.get_url()) {
            return Ok(());
        }

        info!("Login required. Please log in manually in the browser window.");
        let started = std::time::Instant::now();
        let mut last_report = started;
        while started.elapsed() < max_wait {
            tokio::time::sleep(poll).await;
            if self.is_closed() {
                return Err(BrowserError::PageClosed);
            }
            if !is_login_url(&self.tab.get_url()) {
                info!("Login detected, proceeding");
                return Ok(());
            }
            if last_report.elapsed() >= Duration::from_secs(30) {
                last_report = std::time::Instant::now();
                info!(
                    "Still waiting for login... ({}s / {}s)",
                    started.elapsed().as_secs(),
                    max_wait.as_secs()
                );
            }
        }

        warn!("Login wait expired");
        Err(BrowserError::Timeout("login not completed".to_string()))
    }

    fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        let result = self
            .tab
            .evaluate(script, false)
            .map_err(|e| BrowserError::BrowserError(anyhow::anyhow!(e.to_string())))?;
        Ok(result.value.unwrap_or(serde_json::Value::Null))
    }
}

impl CoursePage for ChromePage {
    fn watch_requests(&self, listener: RequestListener) -> Result<(), BrowserError> {
        self.tab
            .register_response_handling(
                "lesson_streams",
                Box::new(move |params, _fetch_body| listener(&params.response.url)),
            )
            .map_err(|e| BrowserError::BrowserError(anyhow::anyhow!(e.to_string())))?;
        Ok(())
    }

    fn advance(&self) -> Result<(), BrowserError> {
        self.tab
            .press_key(&self.config.advance_key)
            .map_err(|e| BrowserError::BrowserError(anyhow::anyhow!(e.to_string())))?;
        Ok(())
    }

    fn nudge(&self) -> Result<(), BrowserError> {
        match self.tab.find_element(&self.config.player_selector) {
            Ok(player) => {
                if let Err(e) = player.click() {
                    debug!("Player click failed: {}", e);
                }
                std::thread::sleep(Duration::from_millis(500));
            }
            Err(e) => debug!("No player element to focus: {}", e),
        }

        self.tab
            .press_key(&self.config.nudge_key)
            .map_err(|e| BrowserError::BrowserError(anyhow::anyhow!(e.to_string())))?;
        Ok(())
    }

    fn lesson_title(&self) -> Result<Option<String>, BrowserError> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.innerText : null; }})()",
            js_string(&self.config.title_selector)
        );
        Ok(match self.evaluate(&script)? {
            serde_json::Value::String(text) => clean_title(&text),
            _ => None,
        })
    }

    fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.tab.get_url())
    }

    fn is_closed(&self) -> bool {
        self.tab.evaluate("1", false).is_err()
    }
}

pub fn is_login_url(url: &str) -> bool {
    url.contains("login") || url.contains("signin")
}

/// Resolves an iframe `src` against the page it was found on.
pub fn absolutize(page_url: &str, src: &str) -> Option<String> {
    if let Ok(url) = Url::parse(src) {
        return Some(url.to_string());
    }
    let base = Url::parse(page_url).ok()?;
    base.join(src).ok().map(|u| u.to_string())
}

fn clean_title(text: &str) -> Option<String> {
    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(first_line.to_string())
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_options_default() {
        let options = NavigationOptions::default();
        assert_eq!(options.timeout_ms, 60000);
        assert!(options.wait_for_idle);
    }

    #[test]
    fn test_page_config_default_keys() {
        let config = PageConfig::default();
        assert_eq!(config.advance_key, "ArrowRight");
        assert_eq!(config.nudge_key, " ");
        assert!(config.player_selector.contains("mux-player"));
    }

    #[test]
    fn test_login_detection() {
        assert!(is_login_url("https://whop.com/login?next=/course"));
        assert!(is_login_url("https://auth.example.com/signin"));
        assert!(!is_login_url("https://courses.apps.whop.com/experience/exp_1/"));
    }

    #[test]
    fn test_absolutize_relative_src() {
        let url = absolutize("https://whop.com/my-course/app", "/core/app/launch/?redirect=x");
        assert_eq!(url.as_deref(), Some("https://whop.com/core/app/launch/?redirect=x"));
    }

    #[test]
    fn test_absolutize_absolute_src() {
        let url = absolutize("https://whop.com/", "https://courses.apps.whop.com/experience/exp_1/");
        assert_eq!(url.as_deref(), Some("https://courses.apps.whop.com/experience/exp_1/"));
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("\n  Intro to Options \nmore"), Some("Intro to Options".to_string()));
        assert_eq!(clean_title("   \n "), None);
    }

    #[test]
    fn test_js_string_escapes_quotes() {
        assert_eq!(js_string(r#"iframe[src*="x"]"#), r#""iframe[src*=\"x\"]""#);
    }
}
