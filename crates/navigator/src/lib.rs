//! Drives a course page from lesson to lesson while the stream sniffer records what plays.
//!
//! [`detect_mode`] probes once whether the page paginates on a key press. Pages that do are
//! walked by [`run_automatic`]; the rest are left to a human while [`run_manual`] listens.

mod automatic;
mod detect;
mod feed;
mod manual;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;

pub use automatic::run_automatic;
pub use detect::detect_mode;
pub use feed::LessonFeed;
pub use manual::run_manual;

use browser::BrowserError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NavigatorError {
    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigationMode {
    Undetected,
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigatorConfig {
    /// How long to wait for the first lesson before probing.
    pub initial_load_timeout: Duration,
    pub probe_timeout: Duration,
    pub step_timeout: Duration,
    /// Consecutive steps without a new lesson that end automatic navigation.
    pub stagnation_threshold: u32,
    /// Nudge the player once before a stall ends automatic navigation.
    pub nudge_on_stall: bool,
    pub max_steps: u32,
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub manual_timeout: Option<Duration>,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            initial_load_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            step_timeout: Duration::from_secs(4),
            stagnation_threshold: 3,
            nudge_on_stall: true,
            max_steps: 150,
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(30),
            manual_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Stagnation threshold reached.
    Exhausted,
    StepLimit,
    PageClosed,
    /// Ctrl-C or an explicit done signal.
    Interrupted,
    TimedOut,
}

/// Ephemeral state of one navigation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationState {
    pub mode: NavigationMode,
    pub last_seen: usize,
    pub stagnation: u32,
    pub steps: u32,
}

impl NavigationState {
    pub fn new(mode: NavigationMode) -> Self {
        Self {
            mode,
            last_seen: 0,
            stagnation: 0,
            steps: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationReport {
    pub state: NavigationState,
    pub ended: EndReason,
}

/// Picks a strategy for the page and runs it to completion.
pub async fn navigate(
    feed: &mut LessonFeed<'_>,
    config: &NavigatorConfig,
) -> Result<NavigationReport, NavigatorError> {
    let report = match detect_mode(feed, config).await? {
        NavigationMode::Automatic => run_automatic(feed, config).await,
        _ => run_manual(feed, config).await,
    };
    feed.drain();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedPage;
    use super::*;
    use sniffer::SniffPattern;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    pub(crate) fn fast_config() -> NavigatorConfig {
        NavigatorConfig {
            initial_load_timeout: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(50),
            step_timeout: Duration::from_millis(20),
            stagnation_threshold: 3,
            nudge_on_stall: true,
            max_steps: 50,
            poll_interval: Duration::from_millis(10),
            report_interval: Duration::from_millis(30),
            manual_timeout: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn test_navigator_config_default() {
        let config = NavigatorConfig::default();
        assert_eq!(config.stagnation_threshold, 3);
        assert_eq!(config.max_steps, 150);
        assert!(config.manual_timeout.is_none());
    }

    #[tokio::test]
    async fn test_navigate_walks_paginated_course() {
        let page = ScriptedPage::course(5, true);
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = LessonFeed::attach(&page, SniffPattern::default(), stop).unwrap();
        page.load();

        let report = navigate(&mut feed, &fast_config()).await.unwrap();

        assert_eq!(report.state.mode, NavigationMode::Automatic);
        assert_eq!(report.ended, EndReason::Exhausted);
        let keys: Vec<String> = feed.records().into_iter().map(|r| r.stream_key).collect();
        assert_eq!(keys, vec!["lesson1", "lesson2", "lesson3", "lesson4", "lesson5"]);
    }

    #[tokio::test]
    async fn test_navigate_falls_back_to_manual() {
        let page = Arc::new(ScriptedPage::course(4, false));
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = LessonFeed::attach(page.as_ref(), SniffPattern::default(), stop).unwrap();
        page.load();

        let operator = {
            let page = page.clone();
            tokio::spawn(async move {
                // after the probe window has closed
                tokio::time::sleep(Duration::from_millis(200)).await;
                for _ in 0..3 {
                    page.click_next();
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
                page.close();
            })
        };

        let report = navigate(&mut feed, &fast_config()).await.unwrap();
        operator.await.unwrap();

        assert_eq!(report.state.mode, NavigationMode::Manual);
        assert_eq!(report.ended, EndReason::PageClosed);
        assert_eq!(feed.records().len(), 4);
    }
}
