//! Opening and clearing persistent stores by namespace
//!
//! The manager is the only place that knows where namespaces live on disk.
//! It keeps a weak reference to every store it opened so that clearing a
//! namespace can tell whether other handles still use it.

use super::FileStore;
use crate::error::Result;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;
use tracing::{info, warn};

/// Result of a cache clear; clearing never fails hard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearOutcome {
    /// The namespace directory was removed
    Cleared,
    /// Nothing was stored under the namespace
    NotFound,
    /// Removal was attempted and failed
    Failed(String),
    /// Open handles kept the namespace busy for every attempt
    GaveUp { attempts: u32 },
}

impl ClearOutcome {
    pub fn is_cleared(&self) -> bool {
        matches!(self, ClearOutcome::Cleared | ClearOutcome::NotFound)
    }
}

/// Opens [`FileStore`]s under a root directory and clears them by name
pub struct StoreManager {
    root: PathBuf,
    open_handles: Mutex<HashMap<String, Vec<Weak<FileStore>>>>,
}

impl StoreManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        StoreManager {
            root: root.as_ref().to_path_buf(),
            open_handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    /// Open the store of a namespace
    pub async fn open(&self, namespace: &str) -> Result<Arc<FileStore>> {
        let store = Arc::new(FileStore::open(self.namespace_dir(namespace)).await?);
        let mut handles = self
            .open_handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handles
            .entry(namespace.to_string())
            .or_default()
            .push(Arc::downgrade(&store));
        Ok(store)
    }

    /// Number of live, unclosed handles to a namespace
    pub fn open_handle_count(&self, namespace: &str) -> usize {
        let mut handles = self
            .open_handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(list) = handles.get_mut(namespace) else {
            return 0;
        };
        list.retain(|weak| weak.upgrade().is_some_and(|store| !store.is_closed()));
        list.len()
    }

    /// Delete an entire namespace
    ///
    /// While other handles keep the namespace open, the attempt is retried after
    /// `retry_delay`, at most `max_retries` attempts in total. Always completes.
    pub async fn clear(
        &self,
        namespace: &str,
        max_retries: u32,
        retry_delay: Duration,
    ) -> ClearOutcome {
        let dir = self.namespace_dir(namespace);
        let max_retries = max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(
                "Clearing cache namespace {} ({}) attempt={}",
                namespace,
                dir.display(),
                attempt
            );

            let open = self.open_handle_count(namespace);
            if open > 0 {
                warn!(
                    "Cache clear blocked: {} open handle(s) on namespace {}",
                    open, namespace
                );
                if attempt < max_retries {
                    sleep(retry_delay).await;
                    continue;
                }
                warn!("Cache clear giving up after {} attempts", attempt);
                return ClearOutcome::GaveUp { attempts: attempt };
            }

            return match fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    info!("Cache namespace {} cleared", namespace);
                    ClearOutcome::Cleared
                }
                Err(e) if e.kind() == ErrorKind::NotFound => ClearOutcome::NotFound,
                Err(e) => {
                    warn!("Cache clear error for namespace {}: {}", namespace, e);
                    ClearOutcome::Failed(e.to_string())
                }
            };
        }
    }
}
