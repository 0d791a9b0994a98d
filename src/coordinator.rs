//! Fetch coordination: cache replay, network download and verification
//!
//! Every request runs on its own background task. The task first looks for a
//! complete manifest and replays the cached chunks. Otherwise it downloads the
//! object, splitting the body into fixed-size chunks that are stored and
//! forwarded to the consumer as they fill. After a download every stored
//! chunk is read back before the manifest is committed.
//!
//! Events travel over a bounded channel; the worker awaits capacity before
//! producing more, so at most `channel_capacity` chunks plus the one being
//! filled are held in memory per request.
//!
//! Requests for the same object key are serialized by a per-key lock, so two
//! workers never write chunks of one object concurrently.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;
use crate::models::{
    to_mb, FetchEvent, FetchState, ManifestRecord, ObjectKey, Origin, Progress,
};
use crate::store::ChunkStore;
use crate::stream::{ObjectStream, ProgressCallback};
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Chunk size used when a request does not choose one
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const LOG_EVERY_CHUNKS: u64 = 50;

/// One object to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub source_url: String,
    pub object_key: ObjectKey,
    /// Size of newly downloaded chunks; replay uses the size in the manifest
    pub chunk_size: usize,
}

impl FetchRequest {
    pub fn new(source_url: impl Into<String>, object_key: ObjectKey) -> Self {
        FetchRequest {
            source_url: source_url.into(),
            object_key,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Lock table serializing workers per object key
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<ObjectKey, Weak<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &ObjectKey) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let created = Arc::new(AsyncMutex::new(()));
                    locks.insert(key.clone(), Arc::downgrade(&created));
                    created
                }
            }
        };
        mutex.lock_owned().await
    }
}

/// Starts fetch workers and hands out their streams
pub struct Coordinator {
    store: Option<Arc<dyn ChunkStore>>,
    client: Client,
    config: Arc<CacheConfig>,
    metrics: Arc<CacheMetrics>,
    key_locks: Arc<KeyLocks>,
}

impl Coordinator {
    /// Create a coordinator; `store: None` runs network-only
    pub fn new(config: Arc<CacheConfig>, store: Option<Arc<dyn ChunkStore>>) -> Result<Self> {
        Self::with_metrics(config, store, Arc::new(CacheMetrics::new()))
    }

    pub fn with_metrics(
        config: Arc<CacheConfig>,
        store: Option<Arc<dyn ChunkStore>>,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true);
        if let Some(limit) = config.request_timeout() {
            builder = builder.timeout(limit);
        }
        let client = builder
            .build()
            .map_err(|e| CacheError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Coordinator {
            store,
            client,
            config,
            metrics,
            key_locks: Arc::new(KeyLocks::default()),
        })
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Start fetching an object
    ///
    /// Must be called inside a tokio runtime. The returned stream owns the
    /// request: dropping it cancels the worker.
    pub fn fetch(&self, request: FetchRequest, on_progress: Option<ProgressCallback>) -> ObjectStream {
        self.fetch_with_cancel(request, on_progress, CancellationToken::new())
    }

    /// Start fetching an object under an externally owned cancellation token
    pub fn fetch_with_cancel(
        &self,
        request: FetchRequest,
        on_progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> ObjectStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let worker = DownloadWorker {
            store: self.store.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            request,
            tx,
            cancel: cancel.clone(),
            state: FetchState::CheckingCache,
            last_loaded: 0,
            last_percent: 0,
        };
        let handle = tokio::spawn(worker.run(self.key_locks.clone()));
        ObjectStream::new(rx, cancel, Some(handle), self.config.throttle.clone(), on_progress)
    }
}

/// Why a worker stopped early
#[derive(Debug)]
enum Halt {
    Cancelled,
    Failed(CacheError),
}

impl From<CacheError> for Halt {
    fn from(err: CacheError) -> Self {
        Halt::Failed(err)
    }
}

type Step<T> = std::result::Result<T, Halt>;

/// Outcome of trying to serve a request from the store
enum Replay {
    Served,
    Miss,
    /// Chunks `0..delivered` already reached the consumer before replay broke
    Partial { delivered: u64, chunk_size: usize },
}

/// Chunks already handed to the consumer by an interrupted replay
#[derive(Debug, Clone, Copy, Default)]
struct Resume {
    delivered: u64,
    chunk_size: Option<usize>,
}

struct DownloadWorker {
    store: Option<Arc<dyn ChunkStore>>,
    client: Client,
    config: Arc<CacheConfig>,
    metrics: Arc<CacheMetrics>,
    request: FetchRequest,
    tx: mpsc::Sender<FetchEvent>,
    cancel: CancellationToken,
    state: FetchState,
    last_loaded: u64,
    last_percent: u8,
}

impl DownloadWorker {
    async fn run(mut self, key_locks: Arc<KeyLocks>) {
        self.metrics.record_request();
        let key = self.request.object_key.clone();

        let _guard = tokio::select! {
            guard = key_locks.lock(&key) => guard,
            _ = self.cancel.cancelled() => {
                self.metrics.record_cancelled();
                debug!("Request for {} cancelled while waiting for key lock", key);
                return;
            }
        };

        match self.execute().await {
            Ok(()) => {}
            Err(Halt::Cancelled) => {
                self.metrics.record_cancelled();
                info!("Request for {} cancelled in state {}", key, self.state);
            }
            Err(Halt::Failed(e)) => {
                error!("Request for {} failed in state {}: {}", key, self.state, e);
                self.state = FetchState::Error;
                self.metrics.record_failed();
                let _ = self.send(FetchEvent::Error(e)).await;
            }
        }
    }

    async fn execute(&mut self) -> Step<()> {
        self.state = FetchState::CheckingCache;
        let mut resume = Resume::default();

        if let Some(store) = self.store.clone() {
            match self.replay(&store).await? {
                Replay::Served => return Ok(()),
                Replay::Miss => {}
                Replay::Partial { delivered, chunk_size } => {
                    resume = Resume {
                        delivered,
                        chunk_size: Some(chunk_size),
                    };
                }
            }
        }

        self.metrics.record_cache_miss();
        self.download(resume).await
    }

    async fn replay(&mut self, store: &Arc<dyn ChunkStore>) -> Step<Replay> {
        let key = self.request.object_key.clone();

        let manifest = match store.get_manifest(&key).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                debug!("No cached manifest for {}", key);
                return Ok(Replay::Miss);
            }
            Err(e) => {
                warn!("Failed to read manifest for {}: {}", key, e);
                let corrupted = matches!(e, CacheError::Corrupted(_));
                self.absorb_store_error(e)?;
                if corrupted {
                    self.purge(store).await;
                }
                return Ok(Replay::Miss);
            }
        };

        if !manifest.complete || !manifest.is_consistent() {
            warn!(
                "Cached manifest for {} unusable (complete={}, parts={}, total={}); purging",
                key, manifest.complete, manifest.parts, manifest.total_size
            );
            self.purge(store).await;
            return Ok(Replay::Miss);
        }

        for index in 0..manifest.parts {
            self.check_cancelled()?;
            match store.has_chunk(&key, index).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Cached chunk {} of {} missing; purging entry", index, key);
                    self.purge(store).await;
                    return Ok(Replay::Miss);
                }
                Err(e) => {
                    warn!("Failed to check cached chunk {} of {}: {}", index, key, e);
                    self.absorb_store_error(e)?;
                    return Ok(Replay::Miss);
                }
            }
        }

        info!(
            "Cache hit for {}: {} parts, {:.1}MB",
            key,
            manifest.parts,
            to_mb(manifest.total_size)
        );
        self.state = FetchState::ReplayingCache;
        self.metrics.record_cache_hit();
        self.send(FetchEvent::Cache {
            parts: manifest.parts,
            total_size: manifest.total_size,
            chunk_size: manifest.chunk_size,
        })
        .await?;

        let chunk_size = manifest.chunk_size as usize;
        let mut loaded = 0u64;
        for index in 0..manifest.parts {
            self.check_cancelled()?;
            let chunk = match store.get_chunk(&key, index).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    warn!("Cached chunk {} of {} vanished during replay", index, key);
                    return Ok(self.abandon_replay(store, index, chunk_size).await);
                }
                Err(e) => {
                    warn!("Failed to read cached chunk {} of {}: {}", index, key, e);
                    self.absorb_store_error(e)?;
                    return Ok(self.abandon_replay(store, index, chunk_size).await);
                }
            };

            if manifest.expected_chunk_len(index) != Some(chunk.len() as u64) {
                warn!(
                    "Cached chunk {} of {} has {} bytes, expected {:?}",
                    index,
                    key,
                    chunk.len(),
                    manifest.expected_chunk_len(index)
                );
                return Ok(self.abandon_replay(store, index, chunk_size).await);
            }

            loaded += chunk.len() as u64;
            self.metrics.record_bytes_from_cache(chunk.len() as u64);
            if index % LOG_EVERY_CHUNKS == 0 || index + 1 == manifest.parts {
                debug!(
                    "Replayed chunk {}/{} of {} ({:.1}MB)",
                    index + 1,
                    manifest.parts,
                    key,
                    to_mb(loaded)
                );
            }

            self.progress(Progress::new(loaded, Some(manifest.total_size), Origin::Cache))
                .await?;
            self.send(FetchEvent::Chunk {
                index,
                data: chunk,
                last: index + 1 == manifest.parts,
            })
            .await?;
        }

        self.finish(manifest.parts, manifest.total_size, manifest.chunk_size, Origin::Cache)
            .await?;
        Ok(Replay::Served)
    }

    /// Purge a broken entry and report how far replay got
    async fn abandon_replay(
        &mut self,
        store: &Arc<dyn ChunkStore>,
        delivered: u64,
        chunk_size: usize,
    ) -> Replay {
        self.purge(store).await;
        if delivered == 0 {
            Replay::Miss
        } else {
            info!(
                "Resuming {} from the network after {} replayed chunks",
                self.request.object_key, delivered
            );
            Replay::Partial {
                delivered,
                chunk_size,
            }
        }
    }

    async fn download(&mut self, resume: Resume) -> Step<()> {
        self.state = FetchState::DownloadingNetwork;
        let key = self.request.object_key.clone();
        let chunk_size = resume.chunk_size.unwrap_or(self.request.chunk_size).max(1);
        let idle = self.config.read_idle_timeout();

        let mut response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
            sent = self.client.get(&self.request.source_url).send() => {
                sent.map_err(CacheError::from_reqwest)?
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Origin answered {} for {}", status, self.request.source_url);
            return Err(CacheError::from_http_status(status.as_u16()).into());
        }

        let total = response.content_length();
        match total {
            Some(total) => info!("Downloading {} ({:.1}MB)", key, to_mb(total)),
            None => info!("Downloading {} (size unknown)", key),
        }

        let mut store_ok = self.store.is_some();
        let mut buffer = BytesMut::with_capacity(chunk_size);
        let mut index = 0u64;
        let mut loaded = 0u64;

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                read = timeout(idle, response.chunk()) => read,
            };
            let mut piece = match read {
                Err(_) => {
                    return Err(CacheError::Timeout(format!(
                        "no data received for {}ms",
                        idle.as_millis()
                    ))
                    .into())
                }
                Ok(Err(e)) => return Err(CacheError::from_reqwest(e).into()),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(piece))) => piece,
            };

            loaded += piece.len() as u64;
            self.metrics.record_bytes_from_network(piece.len() as u64);

            while !piece.is_empty() {
                if buffer.is_empty() && piece.len() >= chunk_size {
                    let full = piece.split_to(chunk_size);
                    self.flush_chunk(index, full, false, resume.delivered, &mut store_ok)
                        .await?;
                    index += 1;
                    continue;
                }

                let take = (chunk_size - buffer.len()).min(piece.len());
                buffer.extend_from_slice(&piece.split_to(take));
                if buffer.len() == chunk_size {
                    let full = buffer.split().freeze();
                    buffer.reserve(chunk_size);
                    self.flush_chunk(index, full, false, resume.delivered, &mut store_ok)
                        .await?;
                    index += 1;
                }
            }

            self.progress(Progress::new(loaded, total, Origin::Network)).await?;
        }

        if !buffer.is_empty() {
            let tail = buffer.split().freeze();
            self.flush_chunk(index, tail, true, resume.delivered, &mut store_ok)
                .await?;
            index += 1;
        } else if index > 0 && index >= resume.delivered {
            self.send(FetchEvent::Chunk {
                index,
                data: Bytes::new(),
                last: true,
            })
            .await?;
        }
        let parts = index;

        if parts < resume.delivered {
            return Err(CacheError::Protocol(format!(
                "source returned {} chunks but {} were already replayed from cache",
                parts, resume.delivered
            ))
            .into());
        }

        info!(
            "Downloaded {}: {} parts, {:.1}MB",
            key,
            parts,
            to_mb(loaded)
        );

        match self.store.clone() {
            Some(store) if store_ok => {
                self.commit(&store, parts, loaded, chunk_size as u64).await?;
            }
            Some(_) => warn!("Store writes failed for {}; manifest not committed", key),
            None => {}
        }

        self.finish(parts, loaded, chunk_size as u64, Origin::Network)
            .await
    }

    /// Store a chunk (best effort) and forward it unless replay already did
    async fn flush_chunk(
        &mut self,
        index: u64,
        data: Bytes,
        last: bool,
        skip_below: u64,
        store_ok: &mut bool,
    ) -> Step<()> {
        self.check_cancelled()?;
        let key = &self.request.object_key;

        if *store_ok {
            if let Some(store) = &self.store {
                match store.put_chunk(key, index, data.clone()).await {
                    Ok(()) => {
                        self.metrics.record_chunk_stored();
                        if index % LOG_EVERY_CHUNKS == 0 {
                            debug!("Stored chunk {} of {} ({} bytes)", index, key, data.len());
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Failed to store chunk {} of {}: {}; continuing without caching",
                            index, key, e
                        );
                        self.absorb_store_error(e)?;
                        *store_ok = false;
                    }
                }
            }
        }

        if index >= skip_below {
            self.send(FetchEvent::Chunk { index, data, last }).await?;
        }
        Ok(())
    }

    /// Read every stored chunk back and record what is actually there
    async fn commit(
        &mut self,
        store: &Arc<dyn ChunkStore>,
        parts: u64,
        total: u64,
        chunk_size: u64,
    ) -> Step<()> {
        self.state = FetchState::Verifying;
        let key = self.request.object_key.clone();

        let mut verified_parts = 0u64;
        let mut verified_bytes = 0u64;
        for index in 0..parts {
            self.check_cancelled()?;
            match store.get_chunk(&key, index).await {
                Ok(Some(chunk)) => {
                    verified_parts += 1;
                    verified_bytes += chunk.len() as u64;
                }
                Ok(None) => {
                    warn!("Verification of {}: chunk {} missing", key, index);
                    break;
                }
                Err(e) => {
                    warn!("Verification of {}: chunk {} unreadable: {}", key, index, e);
                    self.absorb_store_error(e)?;
                    break;
                }
            }
        }

        let complete = verified_parts == parts && verified_bytes == total;
        if !complete {
            warn!(
                "Verification of {} found {}/{} parts ({} of {} bytes); manifest marked incomplete",
                key, verified_parts, parts, verified_bytes, total
            );
        }

        let record = ManifestRecord::new(key.clone(), verified_bytes, verified_parts, chunk_size, complete);
        match store.put_manifest(&record).await {
            Ok(()) => debug!(
                "Manifest committed for {}: parts={}, complete={}",
                key, record.parts, record.complete
            ),
            Err(e) => {
                error!("Failed to write manifest for {}: {}", key, e);
                self.absorb_store_error(e)?;
            }
        }
        Ok(())
    }

    async fn finish(&mut self, parts: u64, total: u64, chunk_size: u64, origin: Origin) -> Step<()> {
        if self.last_percent != 100 {
            self.last_percent = 100;
            self.last_loaded = total;
            self.send(FetchEvent::Progress(Progress {
                loaded: total,
                total: Some(total),
                percent: 100,
                origin,
            }))
            .await?;
        }

        self.state = FetchState::Complete;
        self.metrics.record_completed();
        info!(
            "Request for {} complete from {}: {} parts, {:.1}MB",
            self.request.object_key,
            origin,
            parts,
            to_mb(total)
        );
        self.send(FetchEvent::Complete {
            parts,
            total_size: total,
            chunk_size,
        })
        .await
    }

    /// Forward progress, dropping updates that would move backwards
    async fn progress(&mut self, progress: Progress) -> Step<()> {
        if progress.loaded < self.last_loaded || progress.percent < self.last_percent {
            return Ok(());
        }
        self.last_loaded = progress.loaded;
        self.last_percent = progress.percent;
        self.send(FetchEvent::Progress(progress)).await
    }

    async fn purge(&self, store: &Arc<dyn ChunkStore>) {
        let key = &self.request.object_key;
        self.metrics.record_purge();
        match store.purge(key).await {
            Ok(removed) => info!("Purged cached entry {} ({} chunks)", key, removed),
            Err(e) => {
                warn!("Failed to purge cached entry {}: {}", key, e);
                self.metrics.record_store_error();
            }
        }
    }

    /// Count a store failure; only errors the store can recover from leave the request running
    fn absorb_store_error(&self, error: CacheError) -> Step<()> {
        self.metrics.record_store_error();
        if error.is_recoverable() {
            Ok(())
        } else {
            Err(Halt::Failed(error))
        }
    }

    fn check_cancelled(&self) -> Step<()> {
        if self.cancel.is_cancelled() || self.tx.is_closed() {
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    async fn send(&self, event: FetchEvent) -> Step<()> {
        self.check_cancelled()?;
        tokio::select! {
            sent = self.tx.send(event) => sent.map_err(|_| Halt::Cancelled),
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
        }
    }
}
