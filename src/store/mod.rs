//! Persistent storage of chunk blobs and manifests
//!
//! A store holds two logical tables:
//! - chunks, keyed by `<object_key>:part:<index>`
//! - manifests, keyed by `<object_key>`
//!
//! The store exclusively owns every persisted byte. Callers only ever hand it
//! immutable [`Bytes`] buffers, so a chunk is shared with the stream consumer
//! without being copied.

pub mod file;
pub mod manager;
pub mod memory;

pub use file::FileStore;
pub use manager::{ClearOutcome, StoreManager};
pub use memory::MemoryStore;

use crate::error::Result;
use crate::models::{ManifestRecord, ObjectKey};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

/// Keyed storage of chunk blobs and per-object manifests
///
/// Implementations assume a single writer per object key at a time; the
/// coordinator enforces this with its per-key lock table.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Read the manifest of an object
    async fn get_manifest(&self, key: &ObjectKey) -> Result<Option<ManifestRecord>>;

    /// Write (or overwrite) a manifest
    ///
    /// Must only be called once every chunk it describes has been verified present.
    async fn put_manifest(&self, record: &ManifestRecord) -> Result<()>;

    async fn delete_manifest(&self, key: &ObjectKey) -> Result<()>;

    /// Remove every chunk of an object, returning how many records were removed
    ///
    /// Removal is per record: a failing record does not stop the others from
    /// being attempted, and the first failure is reported afterwards.
    async fn delete_chunks(&self, key: &ObjectKey) -> Result<usize>;

    async fn get_chunk(&self, key: &ObjectKey, index: u64) -> Result<Option<Bytes>>;

    /// Check presence of a chunk without transferring its payload
    async fn has_chunk(&self, key: &ObjectKey, index: u64) -> Result<bool>;

    /// Store a chunk; writing the same index again replaces it
    async fn put_chunk(&self, key: &ObjectKey, index: u64, data: Bytes) -> Result<()>;

    /// Drop the manifest and every chunk of an object
    async fn purge(&self, key: &ObjectKey) -> Result<usize> {
        let manifest = self.delete_manifest(key).await;
        if let Err(e) = &manifest {
            warn!("Failed to delete manifest during purge: key={}, error={}", key, e);
        }
        let removed = self.delete_chunks(key).await?;
        manifest.map(|_| removed)
    }
}

/// Filesystem-safe encoding of a logical key
///
/// ASCII alphanumerics, `-`, `_` and `.` are kept; every other byte becomes `%XX`.
pub(crate) fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Longest escaped key used verbatim as a file name stem
const MAX_STEM_LEN: usize = 160;
/// Escaped bytes kept in front of the hash of a shortened stem
const HASHED_STEM_PREFIX_LEN: usize = 96;

/// File name stem of an object key
///
/// Keys escaping to at most [`MAX_STEM_LEN`] bytes are used as is. Longer
/// ones keep an escaped prefix followed by `~` and a 64-bit hash of the full
/// key, which keeps chunk file names (stem, separator, index, temp suffix)
/// below the common 255 byte limit. `~` is always escaped by [`escape_key`],
/// so shortened stems never collide with verbatim ones.
pub(crate) fn key_file_stem(key: &str) -> String {
    let escaped = escape_key(key);
    if escaped.len() <= MAX_STEM_LEN {
        return escaped;
    }
    // escaped text is ASCII, any byte offset is a char boundary
    format!("{}~{:016x}", &escaped[..HASHED_STEM_PREFIX_LEN], key_hash(key))
}

/// 64-bit name hash built from two CRC32s, stable across builds and platforms
fn key_hash(key: &str) -> u64 {
    let reversed: Vec<u8> = key.bytes().rev().collect();
    let forward = crc32fast::hash(key.as_bytes());
    let backward = crc32fast::hash(&reversed);
    (u64::from(forward) << 32) | u64::from(backward)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_chunk_key_is_filesystem_safe() {
        let key = ObjectKey::new("gemma-v1-model.task").chunk_key(12);
        let escaped = escape_key(&key);
        assert!(!escaped.contains(':'));
        assert!(!escaped.contains('/'));
        assert_eq!(escaped, "gemma-v1-model.task%3Apart%3A12");
    }

    #[test]
    fn test_escape_keeps_distinct_keys_distinct() {
        // naive sanitizing would map both to "a_b"
        assert_ne!(escape_key("a/b"), escape_key("a_b"));
        assert_ne!(escape_key("a:b"), escape_key("a/b"));
    }

    #[test]
    fn test_escape_non_ascii() {
        let escaped = escape_key("modèle/ü");
        assert!(escaped.is_ascii());
        assert_eq!(escaped, "mod%C3%A8le%2F%C3%BC");
    }

    #[test]
    fn test_short_key_stem_is_escaped_key() {
        assert_eq!(key_file_stem("gemma-v1-a b"), "gemma-v1-a%20b");
        assert_eq!(key_file_stem(&"x".repeat(MAX_STEM_LEN)), "x".repeat(MAX_STEM_LEN));
    }

    #[test]
    fn test_long_key_stem_is_bounded_and_stable() {
        let long = format!("label-v1-{}", "ü".repeat(300));
        let stem = key_file_stem(&long);
        assert!(stem.len() <= HASHED_STEM_PREFIX_LEN + 17);
        assert!(stem.contains('~'));
        assert_eq!(stem, key_file_stem(&long));

        // same prefix, different tail
        let other = format!("{}x", long);
        assert_ne!(key_file_stem(&other), stem);
    }
}
