//! Enrolled-descriptor gallery: store contract, in-memory store, read-mostly cache.

use crate::types::{GalleryEntry, Identity};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("gallery store unavailable: {0}")]
    Unavailable(String),
    #[error("gallery entry {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("gallery store error: {0}")]
    Backend(String),
}

/// Persistence boundary for gallery entries.
///
/// Writes for different identities are independent. Concurrent writes for
/// the same identity are left to the backend's own atomicity.
#[async_trait]
pub trait GalleryStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<GalleryEntry>, StoreError>;

    async fn load_for(&self, identity: &Identity) -> Result<Vec<GalleryEntry>, StoreError>;

    /// Persist one entry, returning it as stored (the backend may assign the id).
    async fn append(&self, entry: GalleryEntry) -> Result<GalleryEntry, StoreError>;

    /// Delete every entry of `identity`, returning how many were removed.
    async fn delete_identity(&self, identity: &Identity) -> Result<usize, StoreError>;

    /// Delete one entry by id. `false` when no such entry exists.
    async fn delete_entry(&self, id: &str) -> Result<bool, StoreError>;
}

/// In-process store, insertion ordered. Used for tests and ephemeral terminals.
#[derive(Default)]
pub struct MemoryGalleryStore {
    entries: RwLock<Vec<GalleryEntry>>,
}

impl MemoryGalleryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<GalleryEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GalleryStore for MemoryGalleryStore {
    async fn load_all(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        Ok(self.entries.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn load_for(&self, identity: &Identity) -> Result<Vec<GalleryEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| &e.identity == identity)
            .cloned()
            .collect())
    }

    async fn append(&self, entry: GalleryEntry) -> Result<GalleryEntry, StoreError> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(entry)
    }

    async fn delete_identity(&self, identity: &Identity) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| &e.identity != identity);
        Ok(before - entries.len())
    }

    async fn delete_entry(&self, id: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() < before)
    }
}

/// Point-in-time copy of the gallery, ordered by identity then enrollment time.
#[derive(Debug)]
pub struct GallerySnapshot {
    entries: Vec<GalleryEntry>,
    generation: u64,
    loaded_at: Instant,
}

impl GallerySnapshot {
    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct enrolled identities.
    pub fn identity_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| &e.identity)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GalleryStats {
    pub identities: usize,
    pub descriptors: usize,
}

/// Read-mostly cache in front of a [`GalleryStore`].
///
/// With a zero TTL every `snapshot()` reloads from the store. With a positive
/// TTL a snapshot is reused until it expires or a write through this gallery
/// bumps the generation counter.
pub struct Gallery {
    store: Arc<dyn GalleryStore>,
    ttl: Duration,
    cache: tokio::sync::RwLock<Option<Arc<GallerySnapshot>>>,
    generation: watch::Sender<u64>,
}

impl Gallery {
    pub fn new(store: Arc<dyn GalleryStore>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            store,
            ttl: Duration::ZERO,
            cache: tokio::sync::RwLock::new(None),
            generation,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current gallery contents, from cache when still fresh.
    pub async fn snapshot(&self) -> Result<Arc<GallerySnapshot>, StoreError> {
        let generation = *self.generation.borrow();

        if !self.ttl.is_zero() {
            if let Some(cached) = self.cache.read().await.as_ref() {
                if cached.generation == generation && cached.age() < self.ttl {
                    return Ok(Arc::clone(cached));
                }
            }
        }

        let mut entries = self.store.load_all().await?;
        entries.sort_by(|a, b| {
            a.identity
                .cmp(&b.identity)
                .then_with(|| a.enrolled_at.cmp(&b.enrolled_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let snapshot = Arc::new(GallerySnapshot {
            entries,
            generation,
            loaded_at: Instant::now(),
        });
        tracing::debug!(
            entries = snapshot.len(),
            generation,
            "gallery snapshot loaded"
        );

        if !self.ttl.is_zero() {
            *self.cache.write().await = Some(Arc::clone(&snapshot));
        }
        Ok(snapshot)
    }

    /// Entries of one identity, read straight from the store.
    pub async fn entries_for(&self, identity: &Identity) -> Result<Vec<GalleryEntry>, StoreError> {
        self.store.load_for(identity).await
    }

    pub async fn append(&self, entry: GalleryEntry) -> Result<GalleryEntry, StoreError> {
        let stored = self.store.append(entry).await?;
        self.invalidate();
        Ok(stored)
    }

    /// Cascading delete of every descriptor owned by `identity`.
    pub async fn remove_identity(&self, identity: &Identity) -> Result<usize, StoreError> {
        let removed = self.store.delete_identity(identity).await?;
        self.invalidate();
        Ok(removed)
    }

    pub async fn remove_entry(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete_entry(id).await?;
        self.invalidate();
        Ok(removed)
    }

    /// Mark the cached snapshot stale, e.g. after a write made by another component.
    pub fn invalidate(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Receiver that observes the generation counter; it changes on every local write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub async fn stats(&self) -> Result<GalleryStats, StoreError> {
        let snapshot = self.snapshot().await?;
        Ok(GalleryStats {
            identities: snapshot.identity_count(),
            descriptors: snapshot.len(),
        })
    }
}
