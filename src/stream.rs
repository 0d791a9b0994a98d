//! Consumer side of a fetch: turns worker events into a pull-based byte stream
//!
//! [`ObjectStream`] receives [`FetchEvent`]s over the bounded channel fed by the
//! download worker. Chunk payloads are yielded in order, progress events go
//! through a [`ProgressThrottle`] to the caller's callback, `Complete` ends the
//! stream and `Error` makes it terminally failed.
//!
//! Events are only pulled while the consumer reads, so a slow consumer slows
//! the worker down instead of growing a queue.

use crate::config::ThrottleConfig;
use crate::error::{CacheError, Result};
use crate::models::{FetchEvent, Origin, Progress};
use crate::throttle::ProgressThrottle;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Progress callback invoked with throttled updates
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Summary carried by the completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub parts: u64,
    pub total_size: u64,
    pub chunk_size: u64,
    pub origin: Origin,
}

#[derive(Debug, Clone)]
enum BridgeState {
    Open,
    Closed,
    Failed(CacheError),
}

/// Pull-based byte stream over one fetch request
///
/// As a [`Stream`] it yields `Ok(chunk)` items in object order, then ends. A
/// failure is yielded once as `Err` and the stream is fused afterwards;
/// [`ObjectStream::next_chunk`] keeps returning the error on every later call.
///
/// Dropping the stream cancels the background worker.
pub struct ObjectStream {
    rx: mpsc::Receiver<FetchEvent>,
    state: BridgeState,
    next_index: u64,
    origin: Origin,
    bytes_yielded: u64,
    last_progress: Option<Progress>,
    completion: Option<Completion>,
    throttle: ProgressThrottle,
    on_progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl ObjectStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<FetchEvent>,
        cancel: CancellationToken,
        worker: Option<JoinHandle<()>>,
        throttle: ThrottleConfig,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        ObjectStream {
            rx,
            state: BridgeState::Open,
            next_index: 0,
            origin: Origin::Network,
            bytes_yielded: 0,
            last_progress: None,
            completion: None,
            throttle: ProgressThrottle::new(throttle),
            on_progress,
            cancel,
            worker,
        }
    }

    /// Read the next chunk of the object
    ///
    /// Returns `Ok(None)` once the object is complete. After a failure every
    /// call returns the same error.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let BridgeState::Failed(error) = &self.state {
            return Err(error.clone());
        }
        match self.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None => match &self.state {
                BridgeState::Failed(error) => Err(error.clone()),
                _ => Ok(None),
            },
        }
    }

    /// Drain the whole object into memory
    ///
    /// Only sensible for small objects; large consumers should read chunk by chunk.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Adapt the stream into a [`tokio::io::AsyncRead`]
    pub fn into_async_read(self) -> StreamReader<ObjectStream, Bytes> {
        StreamReader::new(self)
    }

    /// Stop the request and wait for the background worker to exit
    ///
    /// No further events are delivered and the worker performs no further
    /// store writes once this returns.
    pub async fn cancel(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Download worker ended abnormally after cancel: {}", e);
            }
        }
        self.state = BridgeState::Closed;
        debug!("Object stream cancelled after {} bytes", self.bytes_yielded);
    }

    /// Origin of the bytes currently being served
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Total payload bytes handed to the consumer so far
    pub fn bytes_yielded(&self) -> u64 {
        self.bytes_yielded
    }

    /// Most recent progress event received, throttled or not
    pub fn last_progress(&self) -> Option<Progress> {
        self.last_progress
    }

    /// Completion summary, available once the stream has ended successfully
    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, BridgeState::Failed(_))
    }

    fn report(&mut self, progress: Progress) {
        self.last_progress = Some(progress);
        if let Some(callback) = &self.on_progress {
            if self.throttle.should_emit(&progress, Instant::now()) {
                callback(&progress);
            }
        }
    }

    fn fail(&mut self, error: CacheError) -> Poll<Option<Result<Bytes>>> {
        self.state = BridgeState::Failed(error.clone());
        Poll::Ready(Some(Err(error)))
    }
}

impl Stream for ObjectStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if !matches!(this.state, BridgeState::Open) {
                return Poll::Ready(None);
            }

            let event = match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(event)) => event,
                Poll::Ready(None) => {
                    // only Complete ends the stream cleanly; `cancel(self)` never polls again
                    if this.cancel.is_cancelled() {
                        return this.fail(CacheError::Cancelled);
                    }
                    return this.fail(CacheError::WorkerTerminated);
                }
            };

            match event {
                FetchEvent::Cache { total_size, parts, .. } => {
                    debug!("Cache hit manifest received: parts={}, total={}", parts, total_size);
                    this.origin = Origin::Cache;
                    this.report(Progress {
                        loaded: 0,
                        total: Some(total_size),
                        percent: 0,
                        origin: Origin::Cache,
                    });
                }
                FetchEvent::Progress(progress) => {
                    this.origin = progress.origin;
                    this.report(progress);
                }
                FetchEvent::Chunk { index, data, last } => {
                    if index != this.next_index {
                        this.cancel.cancel();
                        return this.fail(CacheError::Protocol(format!(
                            "expected chunk {}, received chunk {}",
                            this.next_index, index
                        )));
                    }
                    this.next_index += 1;
                    if index % 100 == 0 || last {
                        debug!("chunk {} last={}", index, last);
                    }
                    if !data.is_empty() {
                        this.bytes_yielded += data.len() as u64;
                        return Poll::Ready(Some(Ok(data)));
                    }
                }
                FetchEvent::Complete {
                    parts,
                    total_size,
                    chunk_size,
                } => {
                    this.completion = Some(Completion {
                        parts,
                        total_size,
                        chunk_size,
                        origin: this.origin,
                    });
                    this.state = BridgeState::Closed;
                    return Poll::Ready(None);
                }
                FetchEvent::Error(error) => {
                    warn!("Fetch failed: {}", error);
                    return this.fail(error);
                }
            }
        }
    }
}

impl Drop for ObjectStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
