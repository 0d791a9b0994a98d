//! In-process chunk store
//!
//! Keeps records in memory for the lifetime of the value. Useful for
//! ephemeral caches and for exercising the coordinator without touching disk;
//! write failures can be injected to drive the store error paths.

use super::ChunkStore;
use crate::error::{CacheError, Result};
use crate::models::{ManifestRecord, ObjectKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

const NO_FAILURE: u64 = u64::MAX;

/// Non-persistent [`ChunkStore`]
pub struct MemoryStore {
    chunks: RwLock<HashMap<String, Bytes>>,
    manifests: RwLock<HashMap<ObjectKey, ManifestRecord>>,
    chunk_writes: AtomicU64,
    chunk_reads: AtomicU64,
    fail_chunk_writes_from: AtomicU64,
    drop_chunk_write_at: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            chunks: RwLock::new(HashMap::new()),
            manifests: RwLock::new(HashMap::new()),
            chunk_writes: AtomicU64::new(0),
            chunk_reads: AtomicU64::new(0),
            fail_chunk_writes_from: AtomicU64::new(NO_FAILURE),
            drop_chunk_write_at: AtomicU64::new(NO_FAILURE),
        }
    }

    /// Make every `put_chunk` with `index >= from` fail
    pub fn fail_chunk_writes_from(&self, from: u64) {
        self.fail_chunk_writes_from.store(from, Ordering::SeqCst);
    }

    /// Acknowledge the next `put_chunk` of `index` without keeping it
    ///
    /// Applies once, to the first write of that index under any key.
    pub fn drop_chunk_write_at(&self, index: u64) {
        self.drop_chunk_write_at.store(index, Ordering::SeqCst);
    }

    /// Number of `put_chunk` calls that stored a record so far
    pub fn chunk_writes(&self) -> u64 {
        self.chunk_writes.load(Ordering::SeqCst)
    }

    /// Number of `get_chunk` calls so far
    pub fn chunk_reads(&self) -> u64 {
        self.chunk_reads.load(Ordering::SeqCst)
    }

    /// Number of chunk records currently held
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Remove a single chunk record, returning whether it existed
    pub fn remove_chunk(&self, key: &ObjectKey, index: u64) -> bool {
        self.chunks
            .write()
            .map(|mut c| c.remove(&key.chunk_key(index)).is_some())
            .unwrap_or(false)
    }

    /// Replace a chunk payload without any checks
    pub fn overwrite_chunk(&self, key: &ObjectKey, index: u64, data: Bytes) {
        if let Ok(mut chunks) = self.chunks.write() {
            chunks.insert(key.chunk_key(index), data);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> CacheError {
    CacheError::Store("memory store lock poisoned".to_string())
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn get_manifest(&self, key: &ObjectKey) -> Result<Option<ManifestRecord>> {
        let manifests = self.manifests.read().map_err(poisoned)?;
        Ok(manifests.get(key).cloned())
    }

    async fn put_manifest(&self, record: &ManifestRecord) -> Result<()> {
        let mut manifests = self.manifests.write().map_err(poisoned)?;
        manifests.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn delete_manifest(&self, key: &ObjectKey) -> Result<()> {
        let mut manifests = self.manifests.write().map_err(poisoned)?;
        manifests.remove(key);
        Ok(())
    }

    async fn delete_chunks(&self, key: &ObjectKey) -> Result<usize> {
        let prefix = key.chunk_prefix();
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        let before = chunks.len();
        chunks.retain(|k, _| {
            !k.strip_prefix(&prefix)
                .is_some_and(|index| index.parse::<u64>().is_ok())
        });
        Ok(before - chunks.len())
    }

    async fn get_chunk(&self, key: &ObjectKey, index: u64) -> Result<Option<Bytes>> {
        self.chunk_reads.fetch_add(1, Ordering::SeqCst);
        let chunks = self.chunks.read().map_err(poisoned)?;
        Ok(chunks.get(&key.chunk_key(index)).cloned())
    }

    async fn has_chunk(&self, key: &ObjectKey, index: u64) -> Result<bool> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        Ok(chunks.contains_key(&key.chunk_key(index)))
    }

    async fn put_chunk(&self, key: &ObjectKey, index: u64, data: Bytes) -> Result<()> {
        if index >= self.fail_chunk_writes_from.load(Ordering::SeqCst) {
            return Err(CacheError::Store(format!(
                "injected write failure for chunk {}",
                index
            )));
        }
        if self
            .drop_chunk_write_at
            .compare_exchange(index, NO_FAILURE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        chunks.insert(key.chunk_key(index), data);
        self.chunk_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
