use crate::{EndReason, LessonFeed, NavigationMode, NavigationReport, NavigationState, NavigatorConfig};
use tokio::time::Instant;
use tracing::info;

/// Listens while a human clicks through the lessons.
///
/// Ends when the page is closed, the stop flag is raised, or `manual_timeout` passes.
pub async fn run_manual(feed: &mut LessonFeed<'_>, config: &NavigatorConfig) -> NavigationReport {
    let page = feed.page();
    let mut state = NavigationState::new(NavigationMode::Manual);
    state.last_seen = feed.seen_count();

    info!("{}", "=".repeat(60));
    info!("MANUAL NAVIGATION MODE");
    info!("Automatic navigation is not available for this course.");
    info!("Please click through all lessons in the browser.");
    info!("Video streams are captured as they play.");
    info!("When done, close the browser window or press Ctrl-C.");
    info!("{}", "=".repeat(60));

    let started = Instant::now();
    let mut last_report = started;

    let ended = loop {
        if feed.stop_requested() {
            info!("Done signal received");
            break EndReason::Interrupted;
        }
        if page.is_closed() {
            info!("Browser closed by user");
            break EndReason::PageClosed;
        }
        if let Some(limit) = config.manual_timeout {
            if started.elapsed() >= limit {
                info!("Manual navigation timed out after {}s", limit.as_secs());
                break EndReason::TimedOut;
            }
        }

        if let Some(record) = feed.next_lesson(config.poll_interval).await {
            state.last_seen = feed.seen_count();
            info!("✓ Found lesson #{} ({} so far)", record.index, state.last_seen);
        }

        if last_report.elapsed() >= config.report_interval {
            last_report = Instant::now();
            info!("Still monitoring... ({} lessons found)", feed.seen_count());
        }
    };

    feed.drain();
    state.last_seen = feed.seen_count();
    NavigationReport { state, ended }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedPage;
    use crate::tests::fast_config;
    use sniffer::SniffPattern;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_accumulates_until_page_closed() {
        let page = Arc::new(ScriptedPage::course(6, false));
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = LessonFeed::attach(page.as_ref(), SniffPattern::default(), stop).unwrap();
        page.load();

        let operator = {
            let page = page.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    page.click_next();
                }
                page.close();
            })
        };

        let report = run_manual(&mut feed, &fast_config()).await;
        operator.await.unwrap();

        assert_eq!(report.ended, EndReason::PageClosed);
        assert_eq!(report.state.last_seen, 6);
        assert_eq!(page.advance_count(), 0);
    }

    #[tokio::test]
    async fn test_done_signal_ends_monitoring() {
        let page = ScriptedPage::course(2, false);
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = LessonFeed::attach(&page, SniffPattern::default(), stop.clone()).unwrap();
        page.load();

        let signal = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                stop.store(true, Ordering::SeqCst);
            })
        };

        let report = run_manual(&mut feed, &fast_config()).await;
        signal.await.unwrap();

        assert_eq!(report.ended, EndReason::Interrupted);
        assert_eq!(report.state.last_seen, 1);
    }

    #[tokio::test]
    async fn test_manual_timeout() {
        let page = ScriptedPage::course(2, false);
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = LessonFeed::attach(&page, SniffPattern::default(), stop).unwrap();

        let mut config = fast_config();
        config.manual_timeout = Some(Duration::from_millis(50));
        let report = run_manual(&mut feed, &config).await;

        assert_eq!(report.ended, EndReason::TimedOut);
        assert_eq!(report.state.last_seen, 0);
    }
}
