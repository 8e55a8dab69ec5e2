use crate::concurrency::DEFAULT_PRIORITY;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// One upstream candidate for a logical channel.
///
/// `index` groups sources that share a concurrency cap (typically one index
/// per upstream provider); `sub_index` distinguishes entries within the
/// group. The declared cap and priority seed the group's concurrency
/// record on first contact; environment overrides win.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSource {
    pub url: String,
    pub index: String,
    #[serde(default)]
    pub sub_index: String,
    /// Declared maximum concurrent subscriptions for the group, 0 = unlimited.
    #[serde(default)]
    pub max_concurrency: u64,
    /// Declared priority for the group, higher preferred.
    #[serde(default = "default_priority")]
    pub priority: i64,
}

impl StreamSource {
    pub fn new(url: impl Into<String>, index: impl Into<String>, sub_index: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            index: index.into(),
            sub_index: sub_index.into(),
            max_concurrency: 0,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Declare the group's concurrency cap and priority on this source.
    pub fn with_limits(mut self, max_concurrency: u64, priority: i64) -> Self {
        self.max_concurrency = max_concurrency;
        self.priority = priority;
        self
    }

    /// Stable identity used by per-session exclusion lists.
    pub fn source_key(&self) -> String {
        format!("{}|{}", self.index, self.sub_index)
    }
}

/// Per-request balancer state: sources already attempted and rejected while
/// serving this client. Lives for one HTTP request and is only touched by
/// the handler coordinating that request's retries.
#[derive(Debug, Default)]
pub struct Session {
    tested: HashSet<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_tested(&mut self, key: impl Into<String>) {
        self.tested.insert(key.into());
    }

    pub fn is_tested(&self, key: &str) -> bool {
        self.tested.contains(key)
    }

    /// Forget every exclusion. The balancer does this when a full lap
    /// skipped all candidates, so a request can eventually reach sources
    /// that have recovered.
    pub fn clear(&mut self) {
        self.tested.clear();
    }

    pub fn tested_count(&self) -> usize {
        self.tested.len()
    }
}

/// Resolves a stream ID to its configured upstream candidates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// All sources advertising `stream_id`, in declaration order. Empty for
    /// unknown IDs.
    async fn sources_for(&self, stream_id: &str) -> Vec<StreamSource>;
}

/// In-memory catalog, fed once at startup (or per test).
#[derive(Debug, Default)]
pub struct StaticCatalog {
    channels: RwLock<HashMap<String, Vec<StreamSource>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stream_id: impl Into<String>, sources: Vec<StreamSource>) {
        self.channels.write().insert(stream_id.into(), sources);
    }

    pub fn from_channels(channels: HashMap<String, Vec<StreamSource>>) -> Self {
        Self {
            channels: RwLock::new(channels),
        }
    }
}

#[async_trait]
impl SourceCatalog for StaticCatalog {
    async fn sources_for(&self, stream_id: &str) -> Vec<StreamSource> {
        self.channels
            .read()
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_key_joins_index_and_sub_index() {
        let source = StreamSource::new("http://up/1", "2", "7");
        assert_eq!(source.source_key(), "2|7");
    }

    #[test]
    fn unset_limits_default_to_unlimited_neutral() {
        let source = StreamSource::new("http://up/1", "1", "0");
        assert_eq!(source.max_concurrency, 0);
        assert_eq!(source.priority, DEFAULT_PRIORITY);

        let declared = source.with_limits(3, 12);
        assert_eq!(declared.max_concurrency, 3);
        assert_eq!(declared.priority, 12);
    }

    #[test]
    fn session_tracks_and_clears_exclusions() {
        let mut session = Session::new();
        session.mark_tested("1|0");
        session.mark_tested("1|1");
        assert!(session.is_tested("1|0"));
        assert!(!session.is_tested("2|0"));
        assert_eq!(session.tested_count(), 2);

        session.clear();
        assert!(!session.is_tested("1|0"));
        assert_eq!(session.tested_count(), 0);
    }

    #[tokio::test]
    async fn static_catalog_resolves_known_ids_only() {
        let catalog = StaticCatalog::new();
        catalog.insert(
            "news",
            vec![
                StreamSource::new("http://a/news", "1", "0"),
                StreamSource::new("http://b/news", "2", "0"),
            ],
        );

        assert_eq!(catalog.sources_for("news").await.len(), 2);
        assert!(catalog.sources_for("missing").await.is_empty());
    }

    #[test]
    fn sources_deserialize_from_json() {
        let json = r#"{"url": "http://a/x.ts", "index": "1"}"#;
        let source: StreamSource = serde_json::from_str(json).unwrap();
        assert_eq!(source.url, "http://a/x.ts");
        assert_eq!(source.index, "1");
        assert_eq!(source.sub_index, "");
        assert_eq!(source.max_concurrency, 0);
        assert_eq!(source.priority, DEFAULT_PRIORITY);

        let json = r#"{"url": "http://a/x.ts", "index": "1", "sub_index": "2",
                       "max_concurrency": 4, "priority": 9}"#;
        let source: StreamSource = serde_json::from_str(json).unwrap();
        assert_eq!(source.max_concurrency, 4);
        assert_eq!(source.priority, 9);
    }
}
