//! Core data models for the model cache

use crate::error::CacheError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const MB: f64 = 1024.0 * 1024.0;

/// Separator between an object key and a chunk index in chunk keys
pub(crate) const CHUNK_SEPARATOR: &str = ":part:";

/// Stable identifier of a cacheable object across sessions
///
/// The key embeds the cache key version, so bumping the version makes every
/// older entry unreachable without an explicit migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Wrap an already formed key
    pub fn new(key: impl Into<String>) -> Self {
        ObjectKey(key.into())
    }

    /// Build a versioned key: `<label>-<version>-<last path segment of url>`
    ///
    /// Query strings and fragments are ignored when extracting the file name.
    pub fn versioned(label: &str, version: &str, source_url: &str) -> Self {
        ObjectKey(format!("{}-{}-{}", label, version, url_file_name(source_url)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Logical key of one chunk: `<object_key>:part:<index>`
    pub fn chunk_key(&self, index: u64) -> String {
        format!("{}{}", self.chunk_prefix(), index)
    }

    /// Prefix shared by every chunk of this object
    pub fn chunk_prefix(&self) -> String {
        format!("{}{}", self.0, CHUNK_SEPARATOR)
    }
}

/// Last non-empty path segment of a URL
///
/// Parsed URLs are normalized first (dot segments, backslashes). Strings that
/// do not parse, or have no usable segment, fall back to plain splitting.
pub fn url_file_name(source_url: &str) -> String {
    let parsed = reqwest::Url::parse(source_url).ok().and_then(|url| {
        url.path_segments()?
            .filter(|segment| !segment.is_empty())
            .last()
            .map(str::to_string)
    });
    if let Some(name) = parsed {
        return name;
    }

    let without_query = source_url
        .split(['?', '#'])
        .next()
        .unwrap_or(source_url);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
        .to_string()
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(key: &str) -> Self {
        ObjectKey::new(key)
    }
}

/// Metadata describing how an object is laid out in chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub key: ObjectKey,
    pub total_size: u64,
    pub parts: u64,
    pub chunk_size: u64,
    /// Creation time in milliseconds since the UNIX epoch
    pub timestamp: u64,
    pub complete: bool,
}

impl ManifestRecord {
    pub fn new(key: ObjectKey, total_size: u64, parts: u64, chunk_size: u64, complete: bool) -> Self {
        ManifestRecord {
            key,
            total_size,
            parts,
            chunk_size,
            timestamp: now_millis(),
            complete,
        }
    }

    /// Expected byte length of chunk `index` under this manifest
    ///
    /// Every chunk but the last is exactly `chunk_size`; the last carries the remainder.
    pub fn expected_chunk_len(&self, index: u64) -> Option<u64> {
        if index >= self.parts {
            return None;
        }
        let full = index.checked_mul(self.chunk_size)?;
        if index + 1 == self.parts {
            self.total_size.checked_sub(full)
        } else {
            Some(self.chunk_size)
        }
    }

    /// Check that the declared layout is self-consistent
    pub fn is_consistent(&self) -> bool {
        if self.parts == 0 {
            return self.total_size == 0;
        }
        if self.chunk_size == 0 {
            return false;
        }
        match self.expected_chunk_len(self.parts - 1) {
            Some(last) => last > 0 && last <= self.chunk_size,
            None => false,
        }
    }
}

/// Where the bytes of a request are coming from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Cache,
    Network,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Cache => write!(f, "cache"),
            Origin::Network => write!(f, "network"),
        }
    }
}

/// A progress notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    /// `None` when the source did not declare a length
    pub total: Option<u64>,
    pub percent: u8,
    pub origin: Origin,
}

impl Progress {
    /// Build a progress value, computing the rounded percentage
    pub fn new(loaded: u64, total: Option<u64>, origin: Origin) -> Self {
        Progress {
            loaded,
            total,
            percent: percent_of(loaded, total),
            origin,
        }
    }

    /// Human readable status line
    pub fn describe(&self) -> String {
        let label = match self.origin {
            Origin::Cache => "Load from cache",
            Origin::Network => "Downloading (stream)",
        };
        let loaded_mb = (self.loaded as f64 / MB).round() as u64;
        match self.total.map(|t| (t as f64 / MB).round() as u64) {
            Some(total_mb) if total_mb > 0 => format!(
                "{}: {}MB / {}MB ({}%)",
                label, loaded_mb, total_mb, self.percent
            ),
            _ => format!("{}: {}MB received", label, loaded_mb),
        }
    }
}

/// Rounded percentage of `loaded` over `total`, clamped to 100
///
/// Unknown or zero totals report 0.
pub fn percent_of(loaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            let pct = ((loaded as f64 / total as f64) * 100.0).round();
            pct.clamp(0.0, 100.0) as u8
        }
        _ => 0,
    }
}

/// Message sent from the download worker to the stream consumer
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// A complete manifest was found and replay is starting
    Cache {
        parts: u64,
        total_size: u64,
        chunk_size: u64,
    },
    Progress(Progress),
    /// Chunk payload; `last` marks the final chunk
    ///
    /// When an object ends exactly on a chunk boundary the last flag travels on
    /// an extra marker at the next index with an empty payload.
    Chunk { index: u64, data: Bytes, last: bool },
    Complete {
        parts: u64,
        total_size: u64,
        chunk_size: u64,
    },
    Error(CacheError),
}

/// States of one fetch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    CheckingCache,
    ReplayingCache,
    DownloadingNetwork,
    Verifying,
    Complete,
    Error,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchState::CheckingCache => "checking_cache",
            FetchState::ReplayingCache => "replaying_cache",
            FetchState::DownloadingNetwork => "downloading_network",
            FetchState::Verifying => "verifying",
            FetchState::Complete => "complete",
            FetchState::Error => "error",
        };
        f.write_str(name)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / MB
}
