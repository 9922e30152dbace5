use browser::{BrowserError, CoursePage};
use sequencer::{LessonRecord, LessonSequencer, Sequenced};
use sniffer::{SniffPattern, StreamReceiver, StreamSniffer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

type LessonHook<'a> = Box<dyn FnMut(&LessonRecord) + 'a>;

/// Joins the sniffer's event queue to the sequencer for one page.
///
/// Navigators only ever block here, on the queue, never on shared state.
pub struct LessonFeed<'a> {
    page: &'a dyn CoursePage,
    rx: StreamReceiver,
    sequencer: LessonSequencer,
    stop: Arc<AtomicBool>,
    on_lesson: Option<LessonHook<'a>>,
}

impl<'a> LessonFeed<'a> {
    pub fn new(page: &'a dyn CoursePage, rx: StreamReceiver, stop: Arc<AtomicBool>) -> Self {
        Self {
            page,
            rx,
            sequencer: LessonSequencer::new(),
            stop,
            on_lesson: None,
        }
    }

    pub fn attach(
        page: &'a dyn CoursePage,
        pattern: SniffPattern,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, BrowserError> {
        let rx = StreamSniffer::attach(page, pattern)?;
        Ok(Self::new(page, rx, stop))
    }

    pub fn with_sequencer(mut self, sequencer: LessonSequencer) -> Self {
        self.sequencer = sequencer;
        self
    }

    /// Called once for every lesson first seen in this run, as soon as it is sequenced.
    pub fn on_lesson(mut self, hook: impl FnMut(&LessonRecord) + 'a) -> Self {
        self.on_lesson = Some(Box::new(hook));
        self
    }

    pub fn page(&self) -> &'a dyn CoursePage {
        self.page
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Waits up to `wait` for a lesson not yet seen in this run. Duplicates are absorbed.
    pub async fn next_lesson(&mut self, wait: Duration) -> Option<LessonRecord> {
        let deadline = Instant::now() + wait;
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(stream)) => {
                    if let Some(record) = self.sequence(stream, true) {
                        return Some(record);
                    }
                }
                Ok(None) => {
                    debug!("Stream queue closed");
                    // Queue is gone for good; honour the wait so callers don't spin.
                    tokio::time::sleep_until(deadline).await;
                    return None;
                }
                Err(_) => return None,
            }
        }
    }

    /// Sequences whatever is already queued without waiting.
    ///
    /// The page has usually moved past these lessons, so they keep fallback titles rather
    /// than borrowing whatever heading is showing now.
    pub fn drain(&mut self) -> usize {
        let mut found = 0;
        while let Ok(stream) = self.rx.try_recv() {
            if self.sequence(stream, false).is_some() {
                found += 1;
            }
        }
        found
    }

    pub fn seen_count(&self) -> usize {
        self.sequencer.seen_count()
    }

    pub fn records(&self) -> Vec<LessonRecord> {
        self.sequencer.records()
    }

    fn sequence(&mut self, stream: sniffer::DiscoveredStream, read_title: bool) -> Option<LessonRecord> {
        let title = if !read_title || self.sequencer.has_seen(&stream.stream_key) {
            None
        } else {
            self.page.lesson_title().ok().flatten()
        };

        match self.sequencer.accept(stream, title) {
            Sequenced::Duplicate { index } => {
                debug!(index, "Duplicate stream ignored");
                None
            }
            outcome => {
                let record = outcome.lesson().cloned()?;
                if let Some(hook) = self.on_lesson.as_mut() {
                    hook(&record);
                }
                Some(record)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{manifest_url, ScriptedPage};

    #[tokio::test]
    async fn test_next_lesson_skips_duplicates_and_times_out() {
        let page = ScriptedPage::scripted(
            &manifest_url(1, "a"),
            vec![vec![manifest_url(1, "b"), manifest_url(1, "c")]],
        );
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = LessonFeed::attach(&page, SniffPattern::default(), stop).unwrap();
        page.load();

        let first = feed.next_lesson(Duration::from_millis(20)).await.unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(first.title, "Module 1");

        page.advance().unwrap();
        assert!(feed.next_lesson(Duration::from_millis(20)).await.is_none());
        assert_eq!(feed.seen_count(), 1);
    }

    #[tokio::test]
    async fn test_hook_sees_each_new_lesson_once() {
        let page = ScriptedPage::course(3, true);
        let stop = Arc::new(AtomicBool::new(false));
        let mut seen = Vec::new();
        {
            let mut feed = LessonFeed::attach(&page, SniffPattern::default(), stop)
                .unwrap()
                .on_lesson(|record| seen.push(record.index));
            page.load();
            page.advance().unwrap();
            page.advance().unwrap();
            page.load();
            assert_eq!(feed.drain(), 3);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_drained_lessons_keep_fallback_titles() {
        let page = ScriptedPage::course(3, true);
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = LessonFeed::attach(&page, SniffPattern::default(), stop).unwrap();
        page.load();
        page.advance().unwrap();
        page.advance().unwrap();
        assert_eq!(page.lesson_title().unwrap().as_deref(), Some("Module 3"));

        assert_eq!(feed.drain(), 3);
        let titles: Vec<String> = feed.records().into_iter().map(|r| r.title).collect();
        assert_eq!(titles, vec!["Lesson_1", "Lesson_2", "Lesson_3"]);
    }

    #[tokio::test]
    async fn test_rediscovered_lessons_count_as_progress() {
        let page = ScriptedPage::course(2, true);
        let stop = Arc::new(AtomicBool::new(false));
        let seeded = LessonSequencer::with_known(vec![("lesson1".to_string(), 1)]);
        let mut feed = LessonFeed::attach(&page, SniffPattern::default(), stop)
            .unwrap()
            .with_sequencer(seeded);
        page.load();

        let record = feed.next_lesson(Duration::from_millis(20)).await.unwrap();
        assert_eq!(record.index, 1);
        page.advance().unwrap();
        let record = feed.next_lesson(Duration::from_millis(20)).await.unwrap();
        assert_eq!(record.index, 2);
    }
}
