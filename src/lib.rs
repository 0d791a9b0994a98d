//! Model Cache
//!
//! A chunked, resumable, integrity-checked download cache for very large
//! binary objects such as ML model weights.
//!
//! # Overview
//!
//! An object is fetched once from its source URL and split into fixed-size
//! chunks while it streams. Each chunk is persisted to a local store and handed
//! to the consumer at the same time, so a multi-gigabyte file never has to be
//! held in memory. A manifest describing the chunk layout is only written once
//! every chunk has been read back, which makes an interrupted download look like
//! a miss rather than a truncated hit. Later requests for the same key replay the
//! chunks from the store.
//!
//! # Features
//!
//! - **Streaming Download**: Chunks are forwarded as soon as they fill
//! - **Bounded Memory**: A bounded channel applies backpressure to the download
//! - **Verified Manifests**: Chunks are re-read before a manifest is committed
//! - **Self-Healing**: Corrupted or partial entries are purged and re-fetched
//! - **Degraded Mode**: Without a usable store every request goes to the network
//! - **Throttled Progress**: Progress callbacks fire at a bounded rate
//! - **Cancellation**: Dropping or cancelling a stream stops its worker
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use model_cache::{CacheConfig, ModelCache, Progress, ProgressCallback};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = ModelCache::open(CacheConfig::default()).await?;
//!
//! let url = "https://models.example.com/gemma.task";
//! let key = cache.object_key("gemma", url);
//! let progress: ProgressCallback = Arc::new(|p: &Progress| println!("{}", p.describe()));
//!
//! let mut stream = cache.load(url, key, Some(progress));
//! while let Some(chunk) = stream.next_chunk().await? {
//!     // hand `chunk` to the model loader
//!     let _ = chunk.len();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ModelCache`]: Entry point owning the store, the coordinator and metrics
//! - [`Coordinator`]: Spawns one worker per request that replays or downloads
//! - [`ObjectStream`]: Consumer side of a request, a [`futures::Stream`] of chunks
//! - [`ChunkStore`]: Storage trait, with [`FileStore`] on disk and [`MemoryStore`] in process
//! - [`StoreManager`]: Opens namespaces and clears them
//! - [`ProgressThrottle`]: Decides which progress updates reach the callback
//! - [`CacheMetrics`]: Counters with Prometheus text export
//!
//! # Configuration
//!
//! Configuration is loaded from a YAML file; every field has a default:
//!
//! ```yaml
//! store_dir: "./model-cache"
//! namespace: "model-cache-models"
//! key_version: "v1"
//! chunk_size: 8388608          # 8MB
//! channel_capacity: 4
//! read_idle_timeout_ms: 60000
//! log_level: info
//! throttle:
//!   network_percent_step: 2
//!   cache_percent_step: 10
//! ```
//!
//! See [`CacheConfig`] for every option.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod store;
pub mod stream;
pub mod throttle;

pub use cache::ModelCache;
pub use config::{CacheConfig, LogLevel, ThrottleConfig};
pub use coordinator::{Coordinator, FetchRequest, DEFAULT_CHUNK_SIZE};
pub use error::{CacheError, Result};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use models::{url_file_name, FetchEvent, FetchState, ManifestRecord, ObjectKey, Origin, Progress};
pub use store::{ChunkStore, ClearOutcome, FileStore, MemoryStore, StoreManager};
pub use stream::{Completion, ObjectStream, ProgressCallback};
pub use throttle::ProgressThrottle;
