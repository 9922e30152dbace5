use crate::{LessonFeed, NavigationMode, NavigatorConfig, NavigatorError};
use tracing::{info, warn};

/// Decides, once per run, whether the page can be paginated programmatically.
///
/// A probe counts as success when a new stream shows up or the page route changes within
/// `probe_timeout`. A heading change on its own is ambiguous and resolves to manual.
pub async fn detect_mode(
    feed: &mut LessonFeed<'_>,
    config: &NavigatorConfig,
) -> Result<NavigationMode, NavigatorError> {
    let page = feed.page();

    if feed.seen_count() == 0 {
        info!("Waiting for course content to load...");
        if feed.next_lesson(config.initial_load_timeout).await.is_none() {
            info!("No lesson stream observed yet, probing anyway");
        }
    }

    info!("Detecting navigation method...");
    let url_before = page.current_url()?;
    let title_before = page.lesson_title().ok().flatten();

    if let Err(e) = page.advance() {
        warn!("Pagination key could not be dispatched: {}", e);
        info!("✗ Keyboard navigation not working");
        return Ok(NavigationMode::Manual);
    }

    if feed.next_lesson(config.probe_timeout).await.is_some() {
        info!("✓ Keyboard navigation detected (new lesson stream)");
        return Ok(NavigationMode::Automatic);
    }

    let url_after = page.current_url()?;
    if url_after != url_before {
        info!("✓ Keyboard navigation detected (lesson route changed)");
        return Ok(NavigationMode::Automatic);
    }

    let title_after = page.lesson_title().ok().flatten();
    if title_after != title_before {
        info!("Probe changed the page heading but produced no stream, treating as manual");
    } else {
        info!("✗ Keyboard navigation not working");
    }
    Ok(NavigationMode::Manual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{KeyResponse, ScriptedPage};
    use crate::tests::fast_config;
    use sniffer::SniffPattern;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    async fn detect_on(page: &ScriptedPage) -> NavigationMode {
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = LessonFeed::attach(page, SniffPattern::default(), stop).unwrap();
        page.load();
        detect_mode(&mut feed, &fast_config()).await.unwrap()
    }

    #[tokio::test]
    async fn test_probe_that_always_times_out_selects_manual() {
        for _ in 0..5 {
            let page = ScriptedPage::course(3, false);
            assert_eq!(detect_on(&page).await, NavigationMode::Manual);
            assert_eq!(page.advance_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_probe_that_always_succeeds_selects_automatic() {
        for _ in 0..5 {
            let page = ScriptedPage::course(3, true);
            assert_eq!(detect_on(&page).await, NavigationMode::Automatic);
            assert_eq!(page.advance_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_route_change_without_stream_is_automatic() {
        let page = ScriptedPage::with_response(3, KeyResponse::RouteOnly);
        assert_eq!(detect_on(&page).await, NavigationMode::Automatic);
    }

    #[tokio::test]
    async fn test_heading_change_alone_is_ambiguous() {
        let page = ScriptedPage::with_response(3, KeyResponse::TitleOnly);
        assert_eq!(detect_on(&page).await, NavigationMode::Manual);
    }

    #[tokio::test]
    async fn test_closed_page_aborts_detection() {
        let page = ScriptedPage::course(3, true);
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = LessonFeed::attach(&page, SniffPattern::default(), stop).unwrap();
        page.load();
        feed.drain();
        page.close();
        // the route read fails once the page is gone
        assert!(detect_mode(&mut feed, &fast_config()).await.is_err());
    }
}
