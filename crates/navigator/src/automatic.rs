use crate::{EndReason, LessonFeed, NavigationMode, NavigationReport, NavigationState, NavigatorConfig};
use tracing::{debug, info, warn};

/// Presses "next" until `stagnation_threshold` consecutive presses turn up no new lesson.
///
/// There is no end-of-course marker in the UI, so stagnation is the only completion signal.
/// With `nudge_on_stall`, a run of misses first gets one nudge (player click plus alternate
/// key) and one more press before the walk ends. Several slow lessons in a row can still end
/// it early; raise the threshold or `step_timeout` for such courses.
pub async fn run_automatic(feed: &mut LessonFeed<'_>, config: &NavigatorConfig) -> NavigationReport {
    let page = feed.page();
    let mut state = NavigationState::new(NavigationMode::Automatic);
    state.last_seen = feed.seen_count();
    let mut nudged = false;
    info!("Using keyboard navigation");

    let ended = loop {
        if feed.stop_requested() {
            break EndReason::Interrupted;
        }
        if page.is_closed() {
            break EndReason::PageClosed;
        }
        if state.steps >= config.max_steps {
            warn!("Stopping after {} navigation steps", state.steps);
            break EndReason::StepLimit;
        }

        state.steps += 1;
        if let Err(e) = page.advance() {
            debug!("Navigation step {} failed: {}", state.steps, e);
        }

        match feed.next_lesson(config.step_timeout).await {
            Some(record) => {
                state.stagnation = 0;
                nudged = false;
                state.last_seen = feed.seen_count();
                info!(
                    "Navigation {}: lesson #{} ({} found)",
                    state.steps, record.index, state.last_seen
                );
            }
            None => {
                state.stagnation += 1;
                debug!(
                    "Navigation {}: no new lesson ({}/{})",
                    state.steps, state.stagnation, config.stagnation_threshold
                );
                if state.stagnation >= config.stagnation_threshold && config.nudge_on_stall && !nudged {
                    nudged = true;
                    info!("Trying alternative navigation...");
                    if let Err(e) = page.nudge() {
                        debug!("Nudge failed: {}", e);
                    }
                    state.stagnation = config.stagnation_threshold.saturating_sub(1);
                    continue;
                }
                if state.stagnation >= config.stagnation_threshold {
                    info!(
                        "No new lessons after {} attempts, {} lessons found",
                        state.stagnation, state.last_seen
                    );
                    break EndReason::Exhausted;
                }
            }
        }
    };

    state.last_seen = feed.seen_count();
    NavigationReport { state, ended }
}
