//! Model Cache command line tool
//!
//! Fetches a model through the cache, replaying it from disk when it was
//! downloaded before, or clears the cache namespace.

use anyhow::{bail, Context};
use model_cache::{
    logging, url_file_name, CacheConfig, ClearOutcome, ModelCache, Progress, ProgressCallback,
};
use std::env;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info};

const USAGE: &str = "usage:
  model-cache fetch <url> <label> [output] [config.yaml]
  model-cache clear [config.yaml]";

/// # Usage
/// ```bash
/// # Download (or replay) a model into ./gemma.task
/// cargo run -- fetch https://models.example.com/gemma.task gemma gemma.task
///
/// # Clear the cache namespace configured in model_cache.yaml
/// cargo run -- clear model_cache.yaml
/// ```
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str);

    match command {
        Some("fetch") if args.len() >= 3 => {
            let config = load_config(args.get(4).map(String::as_str))?;
            logging::init(config.log_level);
            fetch(config, &args[1], &args[2], args.get(3).map(String::as_str)).await
        }
        Some("clear") => {
            let config = load_config(args.get(1).map(String::as_str))?;
            logging::init(config.log_level);
            clear(config).await
        }
        _ => bail!("{}", USAGE),
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<CacheConfig> {
    match path {
        Some(path) => {
            let config = CacheConfig::from_file(path)
                .with_context(|| format!("failed to load configuration from {}", path))?;
            Ok(config)
        }
        None => Ok(CacheConfig::default()),
    }
}

async fn fetch(config: CacheConfig, url: &str, label: &str, output: Option<&str>) -> anyhow::Result<()> {
    let cache = ModelCache::open(config).await?;
    if cache.is_degraded() {
        info!("Cache store unavailable, downloading without caching");
    }

    let key = cache.object_key(label, url);
    let output = output
        .map(str::to_string)
        .unwrap_or_else(|| default_output(url));
    info!("Fetching {} as {} into {}", url, key, output);

    let progress: ProgressCallback = Arc::new(|p: &Progress| info!("{}", p.describe()));
    let mut stream = cache.load(url, key, Some(progress));

    let file = File::create(&output)
        .await
        .with_context(|| format!("failed to create {}", output))?;
    let mut writer = BufWriter::new(file);
    while let Some(chunk) = stream.next_chunk().await? {
        writer.write_all(&chunk).await?;
    }
    writer.flush().await?;

    if let Some(done) = stream.completion() {
        info!(
            "Wrote {} bytes in {} parts from {}",
            done.total_size, done.parts, done.origin
        );
    }
    let stats = cache.metrics();
    info!(
        "network={} bytes, cache={} bytes, store errors={}",
        stats.bytes_from_network, stats.bytes_from_cache, stats.store_errors
    );
    match cache.metrics_handle().render_prometheus() {
        Ok(text) => debug!("Final metrics:\n{}", text),
        Err(e) => debug!("Failed to render metrics: {}", e),
    }
    Ok(())
}

/// Last path segment of the URL, without query or fragment
fn default_output(url: &str) -> String {
    let name = url_file_name(url);
    if name.is_empty() || name.contains(':') || name == "." || name == ".." {
        "model.bin".to_string()
    } else {
        name
    }
}

async fn clear(config: CacheConfig) -> anyhow::Result<()> {
    let cache = ModelCache::open(config).await?;
    match cache.clear_cache().await {
        ClearOutcome::Cleared => info!("Cache cleared"),
        ClearOutcome::NotFound => info!("Nothing to clear"),
        ClearOutcome::Failed(reason) => bail!("cache clear failed: {}", reason),
        ClearOutcome::GaveUp { attempts } => {
            bail!("cache still in use after {} attempts", attempts)
        }
    }
    Ok(())
}
