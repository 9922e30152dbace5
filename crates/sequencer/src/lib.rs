use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sniffer::DiscoveredStream;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonRecord {
    /// 1-based position in presentation order. Never changes once assigned.
    pub index: u32,
    pub title: String,
    pub stream_url: Option<String>,
    pub stream_key: String,
}

pub fn fallback_title(index: u32) -> String {
    format!("Lesson_{}", index)
}

pub fn is_fallback_title(title: &str, index: u32) -> bool {
    title.is_empty() || title == fallback_title(index)
}

/// Outcome of feeding one discovered stream into the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequenced {
    /// Never seen before; got the next free index.
    Assigned(LessonRecord),
    /// Known from a previous run, first sighting in this one. Keeps its old index.
    Rediscovered(LessonRecord),
    /// Already seen in this run.
    Duplicate { index: u32 },
}

impl Sequenced {
    /// The lesson if this observation counts as progress.
    pub fn lesson(&self) -> Option<&LessonRecord> {
        match self {
            Sequenced::Assigned(record) | Sequenced::Rediscovered(record) => Some(record),
            Sequenced::Duplicate { .. } => None,
        }
    }
}

/// Numbers lessons in the order their streams are first observed.
pub struct LessonSequencer {
    lessons: IndexMap<String, LessonRecord>,
    known: HashMap<String, u32>,
    next_index: u32,
}

impl LessonSequencer {
    pub fn new() -> Self {
        Self {
            lessons: IndexMap::new(),
            known: HashMap::new(),
            next_index: 1,
        }
    }

    /// Seeds `stream_key -> index` pairs from an earlier run so re-observed lessons keep their numbers.
    pub fn with_known<I>(known: I) -> Self
    where
        I: IntoIterator<Item = (String, u32)>,
    {
        let known: HashMap<String, u32> = known.into_iter().collect();
        let next_index = known.values().copied().max().map_or(1, |max| max + 1);
        debug!("Sequencer seeded with {} known lessons", known.len());
        Self {
            lessons: IndexMap::new(),
            known,
            next_index,
        }
    }

    /// Keeps new lessons clear of every index up to `highest`, keyed or not.
    pub fn reserve_through(mut self, highest: u32) -> Self {
        self.next_index = self.next_index.max(highest.saturating_add(1));
        self
    }

    pub fn accept(&mut self, stream: DiscoveredStream, title: Option<String>) -> Sequenced {
        if let Some(existing) = self.lessons.get(&stream.stream_key) {
            return Sequenced::Duplicate {
                index: existing.index,
            };
        }

        let (index, rediscovered) = match self.known.get(&stream.stream_key) {
            Some(&index) => (index, true),
            None => {
                let index = self.next_index;
                self.next_index += 1;
                (index, false)
            }
        };

        let record = LessonRecord {
            index,
            title: title.unwrap_or_else(|| fallback_title(index)),
            stream_url: Some(stream.stream_url),
            stream_key: stream.stream_key.clone(),
        };
        self.lessons.insert(stream.stream_key, record.clone());

        if rediscovered {
            debug!(index, "Lesson rediscovered");
            Sequenced::Rediscovered(record)
        } else {
            info!("✓ Lesson #{}: {}", index, record.stream_key);
            Sequenced::Assigned(record)
        }
    }

    /// Lessons observed in this run, ordered by index.
    pub fn records(&self) -> Vec<LessonRecord> {
        let mut records: Vec<LessonRecord> = self.lessons.values().cloned().collect();
        records.sort_by_key(|r| r.index);
        records
    }

    /// Number of distinct lessons observed in this run.
    pub fn seen_count(&self) -> usize {
        self.lessons.len()
    }

    pub fn has_seen(&self, stream_key: &str) -> bool {
        self.lessons.contains_key(stream_key)
    }
}

impl Default for LessonSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(key: &str, token: &str) -> DiscoveredStream {
        DiscoveredStream {
            stream_key: key.to_string(),
            stream_url: format!("https://stream.mux.com/{}.m3u8?token={}", key, token),
            observed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_assigns_in_observation_order() {
        let mut seq = LessonSequencer::new();
        for key in ["a", "b", "c"] {
            seq.accept(stream(key, "t"), None);
        }
        let records = seq.records();
        let indices: Vec<u32> = records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(records[1].stream_key, "b");
        assert_eq!(records[2].title, "Lesson_3");
    }

    #[test]
    fn test_duplicate_key_with_new_token_collapses() {
        let mut seq = LessonSequencer::new();
        let first = seq.accept(stream("a", "one"), Some("Welcome".to_string()));
        let again = seq.accept(stream("a", "two"), None);

        assert!(matches!(first, Sequenced::Assigned(_)));
        assert_eq!(again, Sequenced::Duplicate { index: 1 });
        assert_eq!(seq.seen_count(), 1);
        assert!(seq.records()[0].stream_url.as_deref().unwrap().ends_with("token=one"));
    }

    #[test]
    fn test_indices_never_reassigned_under_interleaved_duplicates() {
        let patterns: [&[&str]; 4] = [
            &["a", "a", "b", "a", "c", "b", "d"],
            &["a", "b", "c", "d", "d", "c", "b", "a"],
            &["d", "a", "d", "a", "c", "c", "b"],
            &["b", "b", "b", "a", "b", "a"],
        ];

        for pattern in patterns {
            let mut seq = LessonSequencer::new();
            let mut issued: HashMap<String, u32> = HashMap::new();
            let mut last_new = 0;

            for (n, key) in pattern.iter().enumerate() {
                match seq.accept(stream(key, &n.to_string()), None) {
                    Sequenced::Assigned(record) => {
                        assert!(record.index > last_new);
                        last_new = record.index;
                        assert!(issued.insert(key.to_string(), record.index).is_none());
                    }
                    Sequenced::Duplicate { index } => {
                        assert_eq!(issued[*key], index);
                    }
                    Sequenced::Rediscovered(_) => panic!("nothing was seeded"),
                }
            }

            let indices: Vec<u32> = seq.records().iter().map(|r| r.index).collect();
            assert!(indices.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(indices.len(), issued.len());
        }
    }

    #[test]
    fn test_seeded_keys_keep_their_index() {
        let mut seq = LessonSequencer::with_known(vec![("a".to_string(), 1), ("b".to_string(), 2)]);

        let a = seq.accept(stream("a", "fresh"), None);
        let c = seq.accept(stream("c", "x"), None);
        let b = seq.accept(stream("b", "fresh"), None);

        assert!(matches!(a, Sequenced::Rediscovered(ref r) if r.index == 1));
        assert!(matches!(c, Sequenced::Assigned(ref r) if r.index == 3));
        assert!(matches!(b, Sequenced::Rediscovered(ref r) if r.index == 2));

        let indices: Vec<u32> = seq.records().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_reserved_indices_are_skipped() {
        let mut seq = LessonSequencer::with_known(vec![("a".to_string(), 1)]).reserve_through(4);

        let b = seq.accept(stream("b", "x"), None);
        assert!(matches!(b, Sequenced::Assigned(ref r) if r.index == 5));

        // a lower reservation never pulls the counter back
        let mut seq = LessonSequencer::with_known(vec![("a".to_string(), 6)]).reserve_through(2);
        let b = seq.accept(stream("b", "x"), None);
        assert!(matches!(b, Sequenced::Assigned(ref r) if r.index == 7));
    }

    #[test]
    fn test_fallback_title_detection() {
        assert!(is_fallback_title("Lesson_4", 4));
        assert!(is_fallback_title("", 4));
        assert!(!is_fallback_title("Lesson_4", 5));
        assert!(!is_fallback_title("Risk management", 4));
    }
}
