//! Reference-counted external scripts and stylesheets.
//!
//! Every panel on a page shares one `ResourceManager`. A URL is inserted
//! into the document once, no matter how many panels use it, and removed
//! when the last of them lets go.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Script,
    Style,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub url: String,
    pub kind: ResourceKind,
}

impl Resource {
    pub fn new(url: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }
}

/// The document element standing for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceElement {
    pub url: String,
    pub kind: ResourceKind,
}

impl ResourceElement {
    fn for_resource(resource: &Resource) -> Self {
        Self {
            url: resource.url.clone(),
            kind: resource.kind,
        }
    }

    pub fn to_html(&self) -> String {
        let url = escape_attribute(&self.url);
        match self.kind {
            ResourceKind::Script => format!(r#"<script src="{}" defer></script>"#, url),
            ResourceKind::Style => format!(r#"<link rel="stylesheet" href="{}">"#, url),
        }
    }
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// What the document reports right after an element is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementStatus {
    /// Still loading; the host calls `ResourceManager::settle` later.
    Loading,
    /// Loaded or failed already.
    Settled,
}

/// The shared document that resource elements are inserted into.
pub trait ElementHost: Send + Sync {
    fn append(&self, element: &ResourceElement) -> ElementStatus;
    fn remove(&self, element: &ResourceElement);
}

/// A document with no network: every element settles on insertion.
#[derive(Debug, Default)]
pub struct StaticDocument {
    elements: std::sync::Mutex<Vec<ResourceElement>>,
}

impl StaticDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elements(&self) -> Vec<ResourceElement> {
        self.elements.lock().unwrap().clone()
    }

    /// Markup for the `<head>` of a rendered page.
    pub fn head_html(&self) -> String {
        self.elements()
            .iter()
            .map(ResourceElement::to_html)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl ElementHost for StaticDocument {
    fn append(&self, element: &ResourceElement) -> ElementStatus {
        self.elements.lock().unwrap().push(element.clone());
        ElementStatus::Settled
    }

    fn remove(&self, element: &ResourceElement) {
        self.elements.lock().unwrap().retain(|e| e != element);
    }
}

struct TrackedResource {
    element: ResourceElement,
    use_count: usize,
    loaded: watch::Sender<bool>,
}

/// Process-wide tracking table, one entry per URL.
pub struct ResourceManager {
    document: Arc<dyn ElementHost>,
    tracked: DashMap<String, TrackedResource>,
}

impl ResourceManager {
    pub fn new(document: Arc<dyn ElementHost>) -> Self {
        Self {
            document,
            tracked: DashMap::new(),
        }
    }

    /// Counts one more user of `resource`, inserting its element if this is
    /// the first. Returns a receiver that turns `true` once the resource has
    /// loaded or failed.
    pub fn register(&self, resource: &Resource) -> watch::Receiver<bool> {
        let (element, receiver) = match self.tracked.entry(resource.url.clone()) {
            Entry::Occupied(mut entry) => {
                let tracked = entry.get_mut();
                tracked.use_count += 1;
                tracing::debug!(url = %resource.url, use_count = tracked.use_count, "resource reused");
                return tracked.loaded.subscribe();
            }
            Entry::Vacant(entry) => {
                let element = ResourceElement::for_resource(resource);
                let (loaded, receiver) = watch::channel(false);
                entry.insert(TrackedResource {
                    element: element.clone(),
                    use_count: 1,
                    loaded,
                });
                (element, receiver)
            }
        };

        // the entry guard is gone, so the host may settle from inside append
        tracing::debug!(url = %resource.url, kind = ?resource.kind, "resource inserted");
        if self.document.append(&element) == ElementStatus::Settled {
            self.settle(&resource.url);
        }
        receiver
    }

    /// Registers `resource` and waits until it has loaded or failed.
    pub async fn acquire(&self, resource: &Resource) {
        let receiver = self.register(resource);
        wait_settled(receiver).await;
    }

    /// Marks a resource as loaded (or failed; both unblock waiters).
    pub fn settle(&self, url: &str) {
        if let Some(tracked) = self.tracked.get(url) {
            tracked.loaded.send_replace(true);
        }
    }

    /// Drops one user. The element is removed when none remain.
    pub fn release(&self, url: &str) {
        let removed = match self.tracked.entry(url.to_string()) {
            Entry::Occupied(mut entry) => {
                let tracked = entry.get_mut();
                tracked.use_count = tracked.use_count.saturating_sub(1);
                if tracked.use_count == 0 {
                    Some(entry.remove())
                } else {
                    None
                }
            }
            Entry::Vacant(_) => {
                tracing::warn!(url, "released a resource that is not tracked");
                None
            }
        };

        if let Some(tracked) = removed {
            self.document.remove(&tracked.element);
            // unblock anyone still waiting on a removed element
            tracked.loaded.send_replace(true);
            tracing::debug!(url, "resource removed");
        }
    }

    pub fn use_count(&self, url: &str) -> usize {
        self.tracked.get(url).map(|t| t.use_count).unwrap_or(0)
    }

    pub fn is_loaded(&self, url: &str) -> bool {
        self.tracked
            .get(url)
            .map(|t| *t.loaded.borrow())
            .unwrap_or(false)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }
}

async fn wait_settled(mut receiver: watch::Receiver<bool>) {
    // a dropped sender means the entry was removed; nothing left to wait for
    let _ = receiver.wait_for(|loaded| *loaded).await;
}

/// The resources of one consumer, registered for as long as it lives.
pub struct ResourceSet {
    manager: Arc<ResourceManager>,
    urls: Vec<String>,
    pending: Vec<watch::Receiver<bool>>,
}

impl ResourceSet {
    pub fn new(manager: Arc<ResourceManager>, resources: &[Resource]) -> Self {
        let mut urls = Vec::with_capacity(resources.len());
        let mut pending = Vec::with_capacity(resources.len());
        for resource in resources {
            pending.push(manager.register(resource));
            urls.push(resource.url.clone());
        }
        Self {
            manager,
            urls,
            pending,
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Resolves when every resource of the set has loaded or failed.
    /// Resolves immediately for an empty set.
    pub async fn loaded(&self) {
        let waits = self.pending.iter().cloned().map(wait_settled);
        futures::future::join_all(waits).await;
    }

    pub fn is_loaded(&self) -> bool {
        self.pending.iter().all(|receiver| *receiver.borrow())
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        for url in &self.urls {
            self.manager.release(url);
        }
    }
}
