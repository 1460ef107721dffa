//! Content partials: named templates fetched from URLs before a pass.

use crate::options::PartialItem;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Shown in place of a partial that could not be fetched.
pub const PARTIAL_FALLBACK: &str = "Unable to load template\n";

#[async_trait]
pub trait PartialSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, String>;
}

/// Partials held in memory, keyed by URL.
#[derive(Debug, Clone, Default)]
pub struct MapPartials {
    entries: HashMap<String, String>,
}

impl MapPartials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: impl Into<String>, content: impl Into<String>) -> Self {
        self.entries.insert(url.into(), content.into());
        self
    }

    pub fn insert(&mut self, url: impl Into<String>, content: impl Into<String>) {
        self.entries.insert(url.into(), content.into());
    }
}

#[async_trait]
impl PartialSource for MapPartials {
    async fn fetch(&self, url: &str) -> Result<String, String> {
        self.entries
            .get(url)
            .cloned()
            .ok_or_else(|| format!("no partial at {}", url))
    }
}

/// Partials read from disk, with URLs resolved against `root`. URLs that
/// would leave `root` are refused.
#[derive(Debug, Clone)]
pub struct DirectoryPartials {
    root: PathBuf,
}

impl DirectoryPartials {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PartialSource for DirectoryPartials {
    async fn fetch(&self, url: &str) -> Result<String, String> {
        let relative = Path::new(url.trim_start_matches('/'));
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(format!("{} is outside the partials directory", url));
        }
        let path = self.root.join(relative);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("{}: {}", path.display(), e))
    }
}

/// Fetches every partial concurrently. Failed fetches are logged and
/// replaced by `PARTIAL_FALLBACK`; order follows `items`.
pub async fn fetch_partials(source: &dyn PartialSource, items: &[PartialItem]) -> Vec<(String, String)> {
    let fetches = items.iter().map(|item| async move {
        let content = match source.fetch(&item.url).await {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(url = %item.url, error = %err, "failed to load partial");
                PARTIAL_FALLBACK.to_string()
            }
        };
        (item.name.clone(), content)
    });
    futures::future::join_all(fetches).await
}
