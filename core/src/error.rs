use thiserror::Error;

use crate::transcript::DateKey;

/// Durable or metadata store failure. Always absorbed as a cache miss.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("quota exceeded: {needed} bytes requested, {limit} allowed")]
    QuotaExceeded { needed: usize, limit: usize },
    #[error("corrupted entry for key {0}")]
    Corrupted(String),
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network or source failure while fetching a bulk payload.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Bulk payload is not valid serialized data.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("index payload is version {index} but comics payload is version {comics}")]
    VersionSkew { index: String, comics: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed transcript {date}: {reason}")]
pub struct MalformedDocument {
    pub date: DateKey,
    pub reason: String,
}

/// Every load strategy failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("all load strategies failed: {}", attempts.join("; "))]
    Exhausted { attempts: Vec<String> },
    #[error("load task ended without reporting a result")]
    Aborted,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("search index is not loaded yet")]
pub struct NotReady;
