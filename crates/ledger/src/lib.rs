use sequencer::{fallback_title, is_fallback_title, LessonRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const LEDGER_DIR: &str = "downloads";
pub const LEDGER_FILE: &str = "video_urls.json";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    StorageError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("No lesson {0} in ledger")]
    UnknownLesson(u32),
}

/// Persisted state of one lesson. Every field is optional on disk so a half-written
/// entry still loads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerEntry {
    pub title: Option<String>,
    pub stream_url: Option<String>,
    pub stream_key: Option<String>,
    pub downloaded: bool,
}

#[derive(Debug, Serialize)]
struct LedgerDocument<'a> {
    course: &'a Option<String>,
    extraction_complete: bool,
    lessons: &'a BTreeMap<u32, LedgerEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Durable `index -> lesson` map for one target directory. The only resumability mechanism.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    course: Option<String>,
    extraction_complete: bool,
    entries: BTreeMap<u32, LedgerEntry>,
}

pub fn ledger_path(target_dir: &Path) -> PathBuf {
    target_dir.join(LEDGER_DIR).join(LEDGER_FILE)
}

impl Ledger {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            course: None,
            extraction_complete: false,
            entries: BTreeMap::new(),
        }
    }

    /// Restores the ledger at `path`. A missing file yields an empty ledger, and so does a
    /// document too damaged to parse. Damaged entries are skipped one by one.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let mut ledger = Self::empty(path);
        let json = match std::fs::read_to_string(&ledger.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No ledger at {:?}, starting empty", ledger.path);
                return Ok(ledger);
            }
            Err(e) => return Err(e.into()),
        };

        let document: Value = match serde_json::from_str(&json) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ledger {:?} is unreadable ({}), treating as absent", ledger.path, e);
                return Ok(ledger);
            }
        };

        match document {
            Value::Object(mut root) if root.get("lessons").map_or(false, Value::is_object) => {
                ledger.course = root.get("course").and_then(Value::as_str).map(str::to_string);
                ledger.extraction_complete = root
                    .get("extraction_complete")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if let Some(Value::Object(lessons)) = root.remove("lessons") {
                    ledger.load_keyed(lessons);
                }
            }
            Value::Object(lessons) => ledger.load_keyed(lessons),
            Value::Array(items) => {
                ledger.load_legacy(items);
                // the list format was only ever written after a finished extraction
                ledger.extraction_complete = !ledger.entries.is_empty();
            }
            _ => warn!("Ledger {:?} has an unexpected shape, treating as absent", ledger.path),
        }

        info!("Loaded {} lessons from {:?}", ledger.entries.len(), ledger.path);
        Ok(ledger)
    }

    fn load_keyed(&mut self, lessons: serde_json::Map<String, Value>) {
        for (key, value) in lessons {
            let index = match key.parse::<u32>() {
                Ok(index) if index > 0 => index,
                _ => {
                    warn!("Skipping ledger entry with bad index {:?}", key);
                    continue;
                }
            };
            match serde_json::from_value::<LedgerEntry>(value) {
                Ok(entry) => {
                    self.entries.insert(index, entry);
                }
                Err(e) => warn!("Skipping unreadable ledger entry {}: {}", index, e),
            }
        }
    }

    /// `[{"index": 1, "title": .., "url": .., "video_id": ..}]`
    fn load_legacy(&mut self, items: Vec<Value>) {
        for (position, item) in items.into_iter().enumerate() {
            let Value::Object(item) = item else {
                warn!("Skipping unreadable ledger item {}", position + 1);
                continue;
            };
            let index = item
                .get("index")
                .and_then(Value::as_u64)
                .and_then(|i| u32::try_from(i).ok())
                .filter(|i| *i > 0)
                .unwrap_or(position as u32 + 1);
            let text = |field: &str| item.get(field).and_then(Value::as_str).map(str::to_string);
            self.entries.insert(
                index,
                LedgerEntry {
                    title: text("title"),
                    stream_url: text("url"),
                    stream_key: text("video_id"),
                    downloaded: false,
                },
            );
        }
    }

    /// Writes the whole ledger and returns only once it is on disk.
    pub fn save(&self) -> Result<(), LedgerError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let document = LedgerDocument {
            course: &self.course,
            extraction_complete: self.extraction_complete,
            lessons: &self.entries,
        };
        let json = serde_json::to_string_pretty(&document)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!("Ledger saved to {:?}", self.path);
        Ok(())
    }

    /// Folds freshly extracted lessons in by index.
    ///
    /// A stored URL is replaced only under `force` or when the entry has none. A record
    /// without a URL never clears one. Replacing a URL with a different stream under `force`
    /// clears the downloaded flag.
    pub fn merge(&mut self, records: &[LessonRecord], force: bool) -> MergeStats {
        let mut stats = MergeStats::default();

        for record in records {
            let added = !self.entries.contains_key(&record.index);
            let entry = self.entries.entry(record.index).or_default();
            let before = entry.clone();

            if let Some(url) = &record.stream_url {
                if force || entry.stream_url.is_none() {
                    let same_stream = entry
                        .stream_key
                        .as_deref()
                        .map_or(true, |key| key == record.stream_key);
                    if !same_stream {
                        debug!(index = record.index, "Different stream at index, resetting download flag");
                        entry.downloaded = false;
                    }
                    entry.stream_url = Some(url.clone());
                    entry.stream_key = Some(record.stream_key.clone());
                }
            }
            if entry.stream_key.is_none() {
                entry.stream_key = Some(record.stream_key.clone());
            }

            let stored_is_fallback = entry
                .title
                .as_deref()
                .map_or(true, |t| is_fallback_title(t, record.index));
            let new_is_real = !is_fallback_title(&record.title, record.index);
            if entry.title.is_none() || (new_is_real && (force || stored_is_fallback)) {
                entry.title = Some(record.title.clone());
            }

            if added {
                stats.added += 1;
            } else if *entry != before {
                stats.updated += 1;
            } else {
                stats.unchanged += 1;
            }
        }

        stats
    }

    /// Sets the downloaded flag and persists straight away.
    pub fn mark_downloaded(&mut self, index: u32) -> Result<(), LedgerError> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(LedgerError::UnknownLesson(index))?;
        entry.downloaded = true;
        self.save()
    }

    pub fn set_course(&mut self, course: &str) {
        self.course = Some(course.to_string());
    }

    pub fn set_extraction_complete(&mut self, complete: bool) {
        self.extraction_complete = complete;
    }

    pub fn extraction_complete(&self) -> bool {
        self.extraction_complete
    }

    /// Whether a run has to open the browser at all.
    pub fn needs_extraction(&self, force: bool) -> bool {
        force
            || !self.extraction_complete
            || self.entries.is_empty()
            || self.entries.values().any(|e| e.stream_url.is_none())
    }

    /// Fills in missing stream keys from stored URLs, e.g. for entries written without a
    /// `stream_key` field. Returns how many entries gained a key.
    pub fn backfill_keys<F>(&mut self, derive_key: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut filled = 0;
        for (index, entry) in self.entries.iter_mut() {
            if entry.stream_key.is_some() {
                continue;
            }
            let Some(key) = entry.stream_url.as_deref().and_then(&derive_key) else {
                continue;
            };
            debug!(index, key = %key, "Stream key derived from stored URL");
            entry.stream_key = Some(key);
            filled += 1;
        }
        filled
    }

    /// Largest index in use, `0` for an empty ledger.
    pub fn highest_index(&self) -> u32 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    /// `stream_key -> index` pairs for seeding the sequencer.
    pub fn known_keys(&self) -> Vec<(String, u32)> {
        self.entries
            .iter()
            .filter_map(|(index, entry)| entry.stream_key.clone().map(|key| (key, *index)))
            .collect()
    }

    pub fn get(&self, index: u32) -> Option<&LedgerEntry> {
        self.entries.get(&index)
    }

    pub fn entries(&self) -> impl Iterator<Item = (u32, &LedgerEntry)> {
        self.entries.iter().map(|(index, entry)| (*index, entry))
    }

    pub fn title_for(&self, index: u32) -> String {
        self.entries
            .get(&index)
            .and_then(|e| e.title.clone())
            .unwrap_or_else(|| fallback_title(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn downloaded_count(&self) -> usize {
        self.entries.values().filter(|e| e.downloaded).count()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
