//! Fallback behavior when the store is missing, failing or holds bad data

use bytes::Bytes;
use model_cache::{
    CacheConfig, CacheError, ChunkStore, MemoryStore, ModelCache, ObjectKey, Origin,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHUNK: usize = 4096;

fn model_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

async fn serve(server: &MockServer, route: &str, body: Vec<u8>, times: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(times)
        .mount(server)
        .await;
}

fn memory_cache(store: &Arc<MemoryStore>, capacity: usize) -> ModelCache {
    let config = CacheConfig {
        channel_capacity: capacity,
        ..Default::default()
    };
    ModelCache::with_store(config, Some(store.clone() as Arc<dyn ChunkStore>)).unwrap()
}

#[tokio::test]
async fn test_degraded_mode_serves_from_network_every_time() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("occupied");
    std::fs::write(&blocker, b"a file, not a directory").unwrap();

    let server = MockServer::start().await;
    let body = model_bytes(10_000);
    serve(&server, "/m.bin", body.clone(), 2).await;

    let config = CacheConfig {
        store_dir: blocker,
        ..Default::default()
    };
    let cache = ModelCache::open(config).await.unwrap();
    assert!(cache.is_degraded());

    let url = format!("{}/m.bin", server.uri());
    for _ in 0..2 {
        let mut stream = cache.load_with_chunk_size(&url, ObjectKey::new("m"), CHUNK, None);
        assert_eq!(stream.read_to_end().await.unwrap(), body);
        assert_eq!(stream.origin(), Origin::Network);
    }
    assert_eq!(cache.metrics().cache_hits, 0);
    assert_eq!(cache.metrics().chunks_stored, 0);
}

#[tokio::test]
async fn test_store_write_failure_still_delivers_object() {
    let server = MockServer::start().await;
    let body = model_bytes(10 * CHUNK + 17);
    serve(&server, "/m.bin", body.clone(), 1).await;

    let store = Arc::new(MemoryStore::new());
    store.fail_chunk_writes_from(3);
    let cache = memory_cache(&store, 4);
    let key = ObjectKey::new("m");

    let url = format!("{}/m.bin", server.uri());
    let mut stream = cache.load_with_chunk_size(&url, key.clone(), CHUNK, None);
    assert_eq!(stream.read_to_end().await.unwrap(), body);

    // no further writes are attempted once one failed, and nothing is committed
    assert_eq!(store.chunk_writes(), 3);
    assert!(store.get_manifest(&key).await.unwrap().is_none());
    assert_eq!(cache.metrics().store_errors, 1);
}

#[tokio::test]
async fn test_undersized_chunk_resumes_from_network_without_duplicates() {
    let server = MockServer::start().await;
    let body = model_bytes(3 * CHUNK + 100);
    serve(&server, "/m.bin", body.clone(), 2).await;

    let store = Arc::new(MemoryStore::new());
    let cache = memory_cache(&store, 4);
    let key = ObjectKey::new("m");
    let url = format!("{}/m.bin", server.uri());

    cache
        .load_with_chunk_size(&url, key.clone(), CHUNK, None)
        .read_to_end()
        .await
        .unwrap();

    // chunk 2 shrinks after the manifest was committed
    store.overwrite_chunk(&key, 2, Bytes::from_static(b"short"));

    let mut stream = cache.load_with_chunk_size(&url, key.clone(), CHUNK, None);
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next_chunk().await.unwrap() {
        chunks.push(chunk);
    }

    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks.concat(), body);
    assert_eq!(stream.origin(), Origin::Network);

    let manifest = store.get_manifest(&key).await.unwrap().unwrap();
    assert!(manifest.complete);
    assert_eq!(manifest.parts, 4);
    assert_eq!(
        store.get_chunk(&key, 2).await.unwrap().unwrap().len(),
        CHUNK
    );
}

#[tokio::test]
async fn test_slow_consumer_bounds_buffered_chunks() {
    let server = MockServer::start().await;
    let body = model_bytes(64 * CHUNK);
    serve(&server, "/big.bin", body.clone(), 1).await;

    let store = Arc::new(MemoryStore::new());
    let capacity = 2;
    let cache = memory_cache(&store, capacity);
    let url = format!("{}/big.bin", server.uri());

    let mut stream = cache.load_with_chunk_size(&url, ObjectKey::new("big"), CHUNK, None);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // capacity queued chunks plus the one being handed over
    assert!(store.chunk_writes() <= (capacity + 1) as u64);

    assert_eq!(stream.read_to_end().await.unwrap(), body);
    assert_eq!(store.chunk_writes(), 64);
}

#[tokio::test]
async fn test_cancel_stops_store_writes() {
    let server = MockServer::start().await;
    let body = model_bytes(16 * CHUNK);
    serve(&server, "/m.bin", body.clone(), 1).await;

    let store = Arc::new(MemoryStore::new());
    let cache = memory_cache(&store, 1);
    let key = ObjectKey::new("m");
    let url = format!("{}/m.bin", server.uri());

    let mut stream = cache.load_with_chunk_size(&url, key.clone(), CHUNK, None);
    let first = stream.next_chunk().await.unwrap().unwrap();
    assert_eq!(first.as_ref(), &body[..CHUNK]);

    stream.cancel().await;
    let writes = store.chunk_writes();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.chunk_writes(), writes);
    assert!(writes < 16);
    assert!(store.get_manifest(&key).await.unwrap().is_none());
    assert_eq!(cache.metrics().cancelled, 1);
}

#[tokio::test]
async fn test_cache_cancel_stops_all_requests() {
    let server = MockServer::start().await;
    let body = model_bytes(16 * CHUNK);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let cache = memory_cache(&store, 1);

    let mut streams: Vec<_> = ["a", "b"]
        .iter()
        .map(|name| {
            cache.load_with_chunk_size(
                &format!("{}/{}.bin", server.uri(), name),
                ObjectKey::new(*name),
                CHUNK,
                None,
            )
        })
        .collect();
    for stream in streams.iter_mut() {
        assert!(stream.next_chunk().await.unwrap().is_some());
    }

    cache.cancel();
    for stream in streams.iter_mut() {
        // chunks queued before the cancel may still arrive, then the error
        let error = loop {
            match stream.next_chunk().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("cancelled stream ended as if complete"),
                Err(e) => break e,
            }
        };
        assert_eq!(error, CacheError::Cancelled);
        assert!(stream.completion().is_none());
        assert!(stream.bytes_yielded() < (16 * CHUNK) as u64);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.get_manifest(&ObjectKey::new("a")).await.unwrap().is_none());
    assert!(store.get_manifest(&ObjectKey::new("b")).await.unwrap().is_none());

    // requests started after a cancel run normally
    let mut fresh = cache.load_with_chunk_size(
        &format!("{}/c.bin", server.uri()),
        ObjectKey::new("c"),
        CHUNK,
        None,
    );
    assert_eq!(fresh.read_to_end().await.unwrap().len(), 16 * CHUNK);
}

#[tokio::test]
async fn test_cache_cancel_fails_async_reader() {
    let server = MockServer::start().await;
    let body = model_bytes(16 * CHUNK);
    serve(&server, "/m.bin", body.clone(), 1).await;

    let store = Arc::new(MemoryStore::new());
    let cache = memory_cache(&store, 1);
    let url = format!("{}/m.bin", server.uri());

    let mut reader = cache
        .load_with_chunk_size(&url, ObjectKey::new("m"), CHUNK, None)
        .into_async_read();
    let mut head = vec![0u8; CHUNK];
    reader.read_exact(&mut head).await.unwrap();
    assert_eq!(head, &body[..CHUNK]);

    cache.cancel();
    let mut rest = Vec::new();
    let error = reader.read_to_end(&mut rest).await.unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::ConnectionAborted);
    assert!(CHUNK + rest.len() < body.len());
}

#[tokio::test]
async fn test_dropped_chunk_write_commits_truncated_manifest() {
    let server = MockServer::start().await;
    let body = model_bytes(3 * CHUNK);
    serve(&server, "/m.bin", body.clone(), 2).await;

    let store = Arc::new(MemoryStore::new());
    // chunk 1 is acknowledged but never lands
    store.drop_chunk_write_at(1);
    let cache = memory_cache(&store, 4);
    let key = ObjectKey::new("m");
    let url = format!("{}/m.bin", server.uri());

    let mut stream = cache.load_with_chunk_size(&url, key.clone(), CHUNK, None);
    assert_eq!(stream.read_to_end().await.unwrap(), body);

    let manifest = store.get_manifest(&key).await.unwrap().unwrap();
    assert!(!manifest.complete);
    assert_eq!(manifest.parts, 1);
    assert_eq!(manifest.total_size, CHUNK as u64);
    assert!(!store.has_chunk(&key, 1).await.unwrap());

    let mut again = cache.load_with_chunk_size(&url, key.clone(), CHUNK, None);
    assert_eq!(again.read_to_end().await.unwrap(), body);
    assert_eq!(again.origin(), Origin::Network);
    assert!(cache.metrics().purges >= 1);

    let manifest = store.get_manifest(&key).await.unwrap().unwrap();
    assert!(manifest.complete);
    assert_eq!(manifest.parts, 3);
    assert_eq!(manifest.total_size, body.len() as u64);
}

#[tokio::test]
async fn test_concurrent_requests_for_same_key_share_one_download() {
    let server = MockServer::start().await;
    let body = model_bytes(8 * CHUNK + 1);
    serve(&server, "/m.bin", body.clone(), 1).await;

    let store = Arc::new(MemoryStore::new());
    let cache = memory_cache(&store, 4);
    let key = ObjectKey::new("m");
    let url = format!("{}/m.bin", server.uri());

    let a = cache.load_with_chunk_size(&url, key.clone(), CHUNK, None);
    let b = cache.load_with_chunk_size(&url, key.clone(), CHUNK, None);

    let (ra, rb) = tokio::join!(
        async move {
            let mut a = a;
            let data = a.read_to_end().await.unwrap();
            (data, a.origin())
        },
        async move {
            let mut b = b;
            let data = b.read_to_end().await.unwrap();
            (data, b.origin())
        }
    );

    assert_eq!(ra.0, body);
    assert_eq!(rb.0, body);
    // whichever ran second replayed what the first committed
    let origins = [ra.1, rb.1];
    assert!(origins.contains(&Origin::Network));
    assert!(origins.contains(&Origin::Cache));
}
