//! Public entry point tying store, coordinator and stream together
//!
//! [`ModelCache`] opens the persistent store of its namespace and starts
//! fetches through a [`Coordinator`]. If the store cannot be opened the cache
//! keeps working in degraded mode: every request goes to the network and
//! nothing is persisted.

use crate::config::CacheConfig;
use crate::coordinator::{Coordinator, FetchRequest};
use crate::error::Result;
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::models::ObjectKey;
use crate::store::{ChunkStore, ClearOutcome, FileStore, StoreManager};
use crate::stream::{ObjectStream, ProgressCallback};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Chunked, resumable download cache for large model files
pub struct ModelCache {
    config: Arc<CacheConfig>,
    manager: StoreManager,
    /// Our own handle on the namespace, if we opened it
    file_store: Mutex<Option<Arc<FileStore>>>,
    coordinator: RwLock<Arc<Coordinator>>,
    metrics: Arc<CacheMetrics>,
    cancel_root: Mutex<CancellationToken>,
}

impl ModelCache {
    /// Validate the configuration and open the namespace store
    ///
    /// A store that fails to open is logged and the cache runs network-only.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let manager = StoreManager::new(&config.store_dir);
        let metrics = Arc::new(CacheMetrics::new());

        let file_store = match manager.open(&config.namespace).await {
            Ok(store) => {
                info!(
                    "Model cache opened at {}",
                    manager.namespace_dir(&config.namespace).display()
                );
                Some(store)
            }
            Err(e) => {
                warn!("Model cache store unavailable, running network-only: {}", e);
                None
            }
        };

        let store = file_store.clone().map(|s| s as Arc<dyn ChunkStore>);
        let coordinator = Coordinator::with_metrics(config.clone(), store, metrics.clone())?;

        Ok(ModelCache {
            config,
            manager,
            file_store: Mutex::new(file_store),
            coordinator: RwLock::new(Arc::new(coordinator)),
            metrics,
            cancel_root: Mutex::new(CancellationToken::new()),
        })
    }

    /// Build a cache over a caller-supplied store; `None` runs network-only
    ///
    /// [`ModelCache::clear_cache`] still clears the configured namespace on disk,
    /// a custom store is left to its owner.
    pub fn with_store(config: CacheConfig, store: Option<Arc<dyn ChunkStore>>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let metrics = Arc::new(CacheMetrics::new());
        let coordinator = Coordinator::with_metrics(config.clone(), store, metrics.clone())?;

        Ok(ModelCache {
            manager: StoreManager::new(&config.store_dir),
            config,
            file_store: Mutex::new(None),
            coordinator: RwLock::new(Arc::new(coordinator)),
            metrics,
            cancel_root: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// True when requests are served without any store
    pub fn is_degraded(&self) -> bool {
        !self.coordinator().has_store()
    }

    /// Versioned key for a model label and its source URL
    pub fn object_key(&self, label: &str, source_url: &str) -> ObjectKey {
        ObjectKey::versioned(label, &self.config.key_version, source_url)
    }

    /// Fetch an object with the configured chunk size
    pub fn load(
        &self,
        source_url: &str,
        object_key: ObjectKey,
        on_progress: Option<ProgressCallback>,
    ) -> ObjectStream {
        self.load_with_chunk_size(source_url, object_key, self.config.chunk_size, on_progress)
    }

    pub fn load_with_chunk_size(
        &self,
        source_url: &str,
        object_key: ObjectKey,
        chunk_size: usize,
        on_progress: Option<ProgressCallback>,
    ) -> ObjectStream {
        let request = FetchRequest::new(source_url, object_key).with_chunk_size(chunk_size);
        let cancel = self.lock_cancel_root().child_token();
        self.coordinator()
            .fetch_with_cancel(request, on_progress, cancel)
    }

    /// Cancel every in-flight request started by this cache
    ///
    /// Streams of those requests end with `CacheError::Cancelled` unless
    /// they had already received their completion event.
    pub fn cancel(&self) {
        let mut root = self.lock_cancel_root();
        root.cancel();
        *root = CancellationToken::new();
        info!("Cancelled all in-flight model requests");
    }

    /// Cancel in-flight requests and delete the whole namespace
    ///
    /// The store is reopened afterwards; if that fails the cache continues
    /// in degraded mode.
    pub async fn clear_cache(&self) -> ClearOutcome {
        self.cancel();

        let own_store = self
            .file_store
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let had_own_store = own_store.is_some();
        if let Some(store) = own_store {
            store.close();
            if let Ok(coordinator) = Coordinator::with_metrics(self.config.clone(), None, self.metrics.clone()) {
                self.set_coordinator(coordinator);
            }
        }

        let outcome = self
            .manager
            .clear(
                &self.config.namespace,
                self.config.clear_max_retries,
                self.config.clear_retry_delay(),
            )
            .await;

        if had_own_store {
            match self.manager.open(&self.config.namespace).await {
                Ok(store) => {
                    let dyn_store = store.clone() as Arc<dyn ChunkStore>;
                    match Coordinator::with_metrics(self.config.clone(), Some(dyn_store), self.metrics.clone()) {
                        Ok(coordinator) => {
                            self.set_coordinator(coordinator);
                            *self.file_store.lock().unwrap_or_else(|p| p.into_inner()) = Some(store);
                        }
                        Err(e) => warn!("Failed to rebuild coordinator after clear: {}", e),
                    }
                }
                Err(e) => warn!("Model cache store unavailable after clear: {}", e),
            }
        }

        outcome
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared metrics collector, e.g. for Prometheus export
    pub fn metrics_handle(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    /// Manager of the on-disk namespaces
    pub fn store_manager(&self) -> &StoreManager {
        &self.manager
    }

    fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_coordinator(&self, coordinator: Coordinator) {
        *self.coordinator.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(coordinator);
    }

    fn lock_cancel_root(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.cancel_root.lock().unwrap_or_else(|p| p.into_inner())
    }
}
