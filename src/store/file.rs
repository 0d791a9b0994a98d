//! Filesystem-backed chunk store
//!
//! Layout of one namespace directory:
//!
//! ```text
//! <namespace>/
//!   chunks/<key stem>%3Apart%3A<index>.chunk
//!   manifests/<key stem>.manifest
//! ```
//!
//! The key stem is the escaped object key, shortened with a hash when the
//! escaped form would make file names too long.
//!
//! Every chunk file starts with a fixed header carrying the part index, the
//! payload length and a CRC32 of the payload. A header or checksum mismatch is
//! reported as a missing chunk so the coordinator re-downloads the object.
//! All writes go through a temporary sibling file that is renamed into place,
//! so a crash never leaves a half written record under a live name.

use super::{escape_key, key_file_stem, ChunkStore};
use crate::error::{CacheError, Result};
use crate::models::{ManifestRecord, ObjectKey, CHUNK_SEPARATOR};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const CHUNK_DIR: &str = "chunks";
const MANIFEST_DIR: &str = "manifests";
const CHUNK_EXT: &str = "chunk";
const MANIFEST_EXT: &str = "manifest";

const CHUNK_MAGIC: u32 = 0x4D43_484B; // "MCHK"
const CHUNK_FORMAT_VERSION: u16 = 1;

/// Fixed-size header in front of every chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkHeader {
    index: u64,
    len: u64,
    crc: u32,
}

impl ChunkHeader {
    pub(crate) const SIZE: usize = 28;

    fn for_payload(index: u64, payload: &[u8]) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        ChunkHeader {
            index,
            len: payload.len() as u64,
            crc: hasher.finalize(),
        }
    }

    fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&CHUNK_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&CHUNK_FORMAT_VERSION.to_le_bytes());
        // bytes 6..8 reserved
        buf[8..16].copy_from_slice(&self.index.to_le_bytes());
        buf[16..24].copy_from_slice(&self.len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(CacheError::Corrupted(format!(
                "chunk header truncated ({} bytes)",
                data.len()
            )));
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != CHUNK_MAGIC {
            return Err(CacheError::Corrupted("bad chunk magic".to_string()));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != CHUNK_FORMAT_VERSION {
            return Err(CacheError::Corrupted(format!(
                "unsupported chunk format version {}",
                version
            )));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&data[8..16]);
        let index = u64::from_le_bytes(word);
        word.copy_from_slice(&data[16..24]);
        let len = u64::from_le_bytes(word);
        let crc = u32::from_le_bytes([data[24], data[25], data[26], data[27]]);
        Ok(ChunkHeader { index, len, crc })
    }

    /// Validate a full chunk file and return its payload
    fn open_payload(raw: Bytes, expected_index: u64) -> Result<Bytes> {
        let header = Self::decode(&raw)?;
        if header.index != expected_index {
            return Err(CacheError::Corrupted(format!(
                "chunk index mismatch: expected {}, found {}",
                expected_index, header.index
            )));
        }
        let payload = raw.slice(Self::SIZE..);
        if payload.len() as u64 != header.len {
            return Err(CacheError::Corrupted(format!(
                "chunk {} length mismatch: header {}, payload {}",
                expected_index,
                header.len,
                payload.len()
            )));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != header.crc {
            return Err(CacheError::Corrupted(format!(
                "chunk {} checksum mismatch",
                expected_index
            )));
        }
        Ok(payload)
    }
}

/// Persistent store rooted at one namespace directory
pub struct FileStore {
    dir: PathBuf,
    closed: AtomicBool,
    tmp_counter: AtomicU64,
}

impl FileStore {
    /// Open (creating if needed) the store at `dir`
    ///
    /// Failure to create or access the directory is reported as
    /// [`CacheError::StoreUnavailable`].
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        for sub in [CHUNK_DIR, MANIFEST_DIR] {
            fs::create_dir_all(dir.join(sub)).await.map_err(|e| {
                CacheError::StoreUnavailable(format!(
                    "cannot open store at {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        info!("Opened chunk store at {}", dir.display());
        Ok(FileStore {
            dir,
            closed: AtomicBool::new(false),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Close the store; every later operation fails with [`CacheError::StoreClosed`]
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed chunk store at {}", self.dir.display());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove a single chunk record, returning whether it existed
    pub async fn remove_chunk(&self, key: &ObjectKey, index: u64) -> Result<bool> {
        self.ensure_open()?;
        remove_if_exists(&self.chunk_path(key, index)).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(CacheError::StoreClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn chunk_path(&self, key: &ObjectKey, index: u64) -> PathBuf {
        self.dir
            .join(CHUNK_DIR)
            .join(format!("{}{}.{}", chunk_name_prefix(key), index, CHUNK_EXT))
    }

    fn manifest_path(&self, key: &ObjectKey) -> PathBuf {
        self.dir
            .join(MANIFEST_DIR)
            .join(format!("{}.{}", key_file_stem(key.as_str()), MANIFEST_EXT))
    }

    /// Write `parts` to a temporary sibling of `path`, then rename it into place
    async fn write_atomic(&self, path: &Path, parts: &[&[u8]]) -> Result<()> {
        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp-{}-{}", std::process::id(), seq));

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            for part in parts {
                file.write_all(part).await?;
            }
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(CacheError::Store(format!(
                "failed to write {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

/// File name prefix shared by every chunk of `key`
fn chunk_name_prefix(key: &ObjectKey) -> String {
    format!("{}{}", key_file_stem(key.as_str()), escape_key(CHUNK_SEPARATOR))
}

#[async_trait]
impl ChunkStore for FileStore {
    async fn get_manifest(&self, key: &ObjectKey) -> Result<Option<ManifestRecord>> {
        self.ensure_open()?;
        let data = match fs::read(self.manifest_path(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Store(format!("manifest read failed: {}", e))),
        };
        let record: ManifestRecord = bincode::deserialize(&data)
            .map_err(|e| CacheError::Corrupted(format!("manifest for {}: {}", key, e)))?;
        if &record.key != key {
            return Err(CacheError::Corrupted(format!(
                "manifest for {} names {}",
                key, record.key
            )));
        }
        Ok(Some(record))
    }

    async fn put_manifest(&self, record: &ManifestRecord) -> Result<()> {
        self.ensure_open()?;
        let data = bincode::serialize(record)?;
        self.write_atomic(&self.manifest_path(&record.key), &[&data]).await?;
        debug!(
            "Stored manifest: key={}, parts={}, total={}, complete={}",
            record.key, record.parts, record.total_size, record.complete
        );
        Ok(())
    }

    async fn delete_manifest(&self, key: &ObjectKey) -> Result<()> {
        self.ensure_open()?;
        remove_if_exists(&self.manifest_path(key)).await.map(|_| ())
    }

    async fn delete_chunks(&self, key: &ObjectKey) -> Result<usize> {
        self.ensure_open()?;
        let prefix = chunk_name_prefix(key);
        let mut entries = fs::read_dir(self.dir.join(CHUNK_DIR))
            .await
            .map_err(|e| CacheError::Store(format!("cannot list chunks: {}", e)))?;

        let mut removed = 0;
        let mut first_error = None;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    first_error.get_or_insert(CacheError::Store(format!(
                        "chunk listing interrupted: {}",
                        e
                    )));
                    break;
                }
            };
            let file_name = entry.file_name();
            // the rest must be exactly an index, so "a" never matches chunks of "a:part:1"
            let matches = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(&format!(".{}", CHUNK_EXT)))
                .and_then(|stem| stem.strip_prefix(&prefix))
                .is_some_and(|index| index.parse::<u64>().is_ok());
            if !matches {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete chunk file {}: {}", entry.path().display(), e);
                    first_error.get_or_insert(CacheError::Store(format!(
                        "failed to delete chunk: {}",
                        e
                    )));
                }
            }
        }

        debug!("Deleted {} chunk records for key={}", removed, key);
        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    async fn get_chunk(&self, key: &ObjectKey, index: u64) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let path = self.chunk_path(key, index);
        let raw = match fs::read(&path).await {
            Ok(raw) => Bytes::from(raw),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Store(format!("chunk read failed: {}", e))),
        };
        match ChunkHeader::open_payload(raw, index) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => {
                warn!("Discarding unreadable chunk {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    async fn has_chunk(&self, key: &ObjectKey, index: u64) -> Result<bool> {
        self.ensure_open()?;
        match fs::metadata(self.chunk_path(key, index)).await {
            Ok(meta) => Ok(meta.is_file() && meta.len() >= ChunkHeader::SIZE as u64),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::Store(format!("chunk stat failed: {}", e))),
        }
    }

    async fn put_chunk(&self, key: &ObjectKey, index: u64, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        let header = ChunkHeader::for_payload(index, &data).encode();
        self.write_atomic(&self.chunk_path(key, index), &[&header, &data])
            .await
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::Store(format!(
            "failed to delete {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("ns")).await.unwrap();
        (dir, store)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = ChunkHeader::for_payload(5, b"hello");
        assert_eq!(ChunkHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_open_payload_detects_bitflip() {
        let payload = b"some chunk payload";
        let mut raw = ChunkHeader::for_payload(0, payload).encode().to_vec();
        raw.extend_from_slice(payload);
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let result = ChunkHeader::open_payload(Bytes::from(raw), 0);
        assert!(matches!(result, Err(CacheError::Corrupted(_))));
    }

    #[test]
    fn test_open_payload_detects_wrong_index() {
        let mut raw = ChunkHeader::for_payload(3, b"x").encode().to_vec();
        raw.push(b'x');
        assert!(ChunkHeader::open_payload(Bytes::from(raw), 4).is_err());
    }

    #[tokio::test]
    async fn test_chunk_roundtrip() {
        let (_dir, store) = open_temp().await;
        let key = ObjectKey::new("model-v1-a.bin");

        assert!(!store.has_chunk(&key, 0).await.unwrap());
        assert_eq!(store.get_chunk(&key, 0).await.unwrap(), None);

        store.put_chunk(&key, 0, Bytes::from_static(b"abc")).await.unwrap();
        assert!(store.has_chunk(&key, 0).await.unwrap());
        assert_eq!(
            store.get_chunk(&key, 0).await.unwrap(),
            Some(Bytes::from_static(b"abc"))
        );

        // last write wins
        store.put_chunk(&key, 0, Bytes::from_static(b"xyz")).await.unwrap();
        assert_eq!(
            store.get_chunk(&key, 0).await.unwrap(),
            Some(Bytes::from_static(b"xyz"))
        );
    }

    #[tokio::test]
    async fn test_corrupt_chunk_reads_as_missing() {
        let (_dir, store) = open_temp().await;
        let key = ObjectKey::new("k");
        store.put_chunk(&key, 0, Bytes::from(vec![7u8; 64])).await.unwrap();

        let path = store.chunk_path(&key, 0);
        let mut raw = std::fs::read(&path).unwrap();
        raw.truncate(raw.len() - 10);
        std::fs::write(&path, raw).unwrap();

        assert_eq!(store.get_chunk(&key, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_manifest_roundtrip_and_delete() {
        let (_dir, store) = open_temp().await;
        let key = ObjectKey::new("model-v1-b.bin");
        let record = ManifestRecord::new(key.clone(), 17, 3, 8, true);

        assert_eq!(store.get_manifest(&key).await.unwrap(), None);
        store.put_manifest(&record).await.unwrap();
        assert_eq!(store.get_manifest(&key).await.unwrap(), Some(record));

        store.delete_manifest(&key).await.unwrap();
        assert_eq!(store.get_manifest(&key).await.unwrap(), None);
        // deleting twice is fine
        store.delete_manifest(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_chunks_only_touches_prefix() {
        let (_dir, store) = open_temp().await;
        let a = ObjectKey::new("a");
        let ab = ObjectKey::new("ab");
        for i in 0..3 {
            store.put_chunk(&a, i, Bytes::from(vec![i as u8; 4])).await.unwrap();
            store.put_chunk(&ab, i, Bytes::from(vec![i as u8; 4])).await.unwrap();
        }

        assert_eq!(store.delete_chunks(&a).await.unwrap(), 3);
        for i in 0..3 {
            assert!(!store.has_chunk(&a, i).await.unwrap());
            assert!(store.has_chunk(&ab, i).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_delete_chunks_ignores_keys_that_extend_the_prefix() {
        let (_dir, store) = open_temp().await;
        let a = ObjectKey::new("a");
        let nested = ObjectKey::new("a:part:x");
        store.put_chunk(&a, 0, Bytes::from_static(b"1")).await.unwrap();
        store.put_chunk(&nested, 0, Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(store.delete_chunks(&a).await.unwrap(), 1);
        assert!(store.has_chunk(&nested, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_very_long_key_roundtrip() {
        let (_dir, store) = open_temp().await;
        let key = ObjectKey::versioned(&"label/".repeat(80), "v1", "https://h/model.bin");
        let sibling = ObjectKey::new(format!("{}2", key));
        assert!(key.as_str().len() > 400);

        for i in 0..3 {
            store.put_chunk(&key, i, Bytes::from(vec![i as u8; 16])).await.unwrap();
        }
        store.put_chunk(&sibling, 0, Bytes::from_static(b"s")).await.unwrap();
        let record = ManifestRecord::new(key.clone(), 48, 3, 16, true);
        store.put_manifest(&record).await.unwrap();

        let name = store.chunk_path(&key, 2);
        assert!(name.file_name().unwrap().len() < 255);
        assert_eq!(store.get_chunk(&key, 2).await.unwrap(), Some(Bytes::from(vec![2u8; 16])));
        assert_eq!(store.get_manifest(&key).await.unwrap(), Some(record));
        assert_eq!(store.get_manifest(&sibling).await.unwrap(), None);

        assert_eq!(store.purge(&key).await.unwrap(), 3);
        assert_eq!(store.get_manifest(&key).await.unwrap(), None);
        assert!(store.has_chunk(&sibling, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_removes_everything_for_key() {
        let (_dir, store) = open_temp().await;
        let key = ObjectKey::new("k");
        store.put_chunk(&key, 0, Bytes::from_static(b"a")).await.unwrap();
        store.put_chunk(&key, 1, Bytes::from_static(b"b")).await.unwrap();
        store
            .put_manifest(&ManifestRecord::new(key.clone(), 2, 2, 1, true))
            .await
            .unwrap();

        assert_eq!(store.purge(&key).await.unwrap(), 2);
        assert_eq!(store.get_manifest(&key).await.unwrap(), None);
        assert!(!store.has_chunk(&key, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let key = ObjectKey::new("persist");
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.put_chunk(&key, 0, Bytes::from_static(b"data")).await.unwrap();
        }
        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get_chunk(&key, 0).await.unwrap(),
            Some(Bytes::from_static(b"data"))
        );
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let (_dir, store) = open_temp().await;
        store.close();
        let key = ObjectKey::new("k");
        assert_eq!(
            store.put_chunk(&key, 0, Bytes::new()).await,
            Err(CacheError::StoreClosed)
        );
        assert_eq!(store.get_manifest(&key).await, Err(CacheError::StoreClosed));
    }
}
