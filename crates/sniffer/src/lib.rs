use browser::{BrowserError, CoursePage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

pub type StreamReceiver = mpsc::UnboundedReceiver<DiscoveredStream>;

/// URL shape of the streaming vendor's HLS manifests,
/// e.g. `https://stream.mux.com/<playback-id>.m3u8?token=...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniffPattern {
    pub host: String,
    pub extension: String,
}

impl Default for SniffPattern {
    fn default() -> Self {
        Self {
            host: "stream.mux.com".to_string(),
            extension: ".m3u8".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredStream {
    /// Playback id from the path. Stable across token refreshes.
    pub stream_key: String,
    /// The full observed URL, query included.
    pub stream_url: String,
    pub observed_at: DateTime<Utc>,
}

impl SniffPattern {
    pub fn new(host: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            extension: extension.into(),
        }
    }

    /// Returns the stream a request URL points at, or `None` if it is not a vendor manifest.
    pub fn extract(&self, raw: &str) -> Option<DiscoveredStream> {
        if !raw.contains(&self.host) || !raw.contains(&self.extension) {
            return None;
        }

        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => {
                debug!("Dropping unparseable manifest URL {}: {}", raw, e);
                return None;
            }
        };
        if url.host_str() != Some(self.host.as_str()) {
            return None;
        }

        let last = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .unwrap_or("");
        let Some(key) = last.strip_suffix(self.extension.as_str()) else {
            debug!("Dropping non-manifest vendor URL {}", raw);
            return None;
        };
        if !is_stream_key(key) {
            debug!("Dropping manifest URL with bad playback id {:?}: {}", key, raw);
            return None;
        }

        Some(DiscoveredStream {
            stream_key: key.to_string(),
            stream_url: raw.to_string(),
            observed_at: Utc::now(),
        })
    }
}

fn is_stream_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Passive listener that turns matching network requests into [`DiscoveredStream`] events.
pub struct StreamSniffer {
    pattern: SniffPattern,
    tx: mpsc::UnboundedSender<DiscoveredStream>,
}

impl StreamSniffer {
    pub fn new(pattern: SniffPattern) -> (Self, StreamReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { pattern, tx }, rx)
    }

    /// Hooks a sniffer into the page's network layer and returns the event queue.
    pub fn attach(page: &dyn CoursePage, pattern: SniffPattern) -> Result<StreamReceiver, BrowserError> {
        let (sniffer, rx) = Self::new(pattern);
        page.watch_requests(Box::new(move |url| sniffer.observe(url)))?;
        debug!("Stream sniffer attached");
        Ok(rx)
    }

    pub fn observe(&self, url: &str) {
        if let Some(stream) = self.pattern.extract(url) {
            debug!(key = %stream.stream_key, "Manifest request observed");
            // Unbounded send never blocks; a closed queue just means the run is over.
            if self.tx.send(stream).is_err() {
                debug!("Stream queue closed, dropping observation");
            }
        }
    }
}
