//! Source catalog loading.
//!
//! The catalog file is a JSON map from stream ID to its upstream
//! candidates:
//!
//! ```json
//! {
//!   "news": [
//!     { "url": "http://cdn-a/news.ts", "index": "1", "sub_index": "0",
//!       "max_concurrency": 4, "priority": 10 },
//!     { "url": "http://cdn-b/news.ts", "index": "2", "sub_index": "0" }
//!   ]
//! }
//! ```
//!
//! `max_concurrency` (0 = unlimited) and `priority` (higher preferred) are
//! optional; they seed the source group's limits and can be overridden via
//! `M3U_MAX_CONCURRENCY_<index>` / `M3U_PRIORITY_<index>`.

use anyhow::Context;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;
use weir_engine::{StaticCatalog, StreamSource};

pub fn load_catalog(path: &Path) -> anyhow::Result<StaticCatalog> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading source catalog {}", path.display()))?;
    let channels: HashMap<String, Vec<StreamSource>> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing source catalog {}", path.display()))?;

    let sources: usize = channels.values().map(Vec::len).sum();
    info!(
        channels = channels.len(),
        sources,
        path = %path.display(),
        "Loaded source catalog"
    );
    Ok(StaticCatalog::from_channels(channels))
}
