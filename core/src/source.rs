use async_trait::async_trait;
use reqwest::{header, Client};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use time::format_description::well_known::Rfc3339;

use crate::error::FetchError;
use crate::persist::IndexPaths;
use crate::transcript::{read_transcripts, TranscriptDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Index,
    Comics,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 2] = [PayloadKind::Index, PayloadKind::Comics];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Index => "index",
            PayloadKind::Comics => "comics",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    /// ETag or Last-Modified equivalent, if the source provides one.
    pub validator: Option<String>,
    /// When the source last changed the payload, if it says.
    pub last_modified: Option<String>,
}

#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Current validator of a payload, without downloading it.
    async fn probe(&self, kind: PayloadKind) -> Result<Option<String>, FetchError>;
    async fn fetch(&self, kind: PayloadKind) -> Result<Fetched, FetchError>;
}

/// Raw transcripts to rebuild the index from when no payload can be had.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn transcripts(&self) -> Result<Vec<TranscriptDocument>, FetchError>;
}

// --- http ---

pub struct HttpSource {
    client: Client,
    index_url: String,
    comics_url: String,
}

impl HttpSource {
    pub fn new(index_url: impl Into<String>, comics_url: impl Into<String>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("comic-archive/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, index_url: index_url.into(), comics_url: comics_url.into() })
    }

    fn url(&self, kind: PayloadKind) -> &str {
        match kind {
            PayloadKind::Index => &self.index_url,
            PayloadKind::Comics => &self.comics_url,
        }
    }
}

fn validator(headers: &header::HeaderMap) -> Option<String> {
    headers
        .get(header::ETAG)
        .or_else(|| headers.get(header::LAST_MODIFIED))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl PayloadSource for HttpSource {
    async fn probe(&self, kind: PayloadKind) -> Result<Option<String>, FetchError> {
        let url = self.url(kind);
        let resp = self.client.head(url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: resp.status().as_u16() });
        }
        Ok(validator(resp.headers()))
    }

    async fn fetch(&self, kind: PayloadKind) -> Result<Fetched, FetchError> {
        let url = self.url(kind);
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: resp.status().as_u16() });
        }
        let validator = validator(resp.headers());
        let last_modified = resp
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await?.to_vec();
        tracing::debug!(url, size = bytes.len(), "fetched payload");
        Ok(Fetched { bytes, validator, last_modified })
    }
}

// --- directory ---

/// Reads the files an indexer run wrote. Validator is the file mtime.
pub struct DirSource {
    paths: IndexPaths,
}

impl DirSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self { Self { paths: IndexPaths::new(root) } }

    fn path(&self, kind: PayloadKind) -> PathBuf {
        match kind {
            PayloadKind::Index => self.paths.index(),
            PayloadKind::Comics => self.paths.comics(),
        }
    }
}

fn modified(path: &Path) -> Result<Option<String>, FetchError> {
    let mtime: SystemTime = std::fs::metadata(path)?.modified()?;
    Ok(time::OffsetDateTime::from(mtime).format(&Rfc3339).ok())
}

async fn blocking<T, F>(f: F) -> Result<T, FetchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FetchError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FetchError::Unavailable(e.to_string()))?
}

#[async_trait]
impl PayloadSource for DirSource {
    async fn probe(&self, kind: PayloadKind) -> Result<Option<String>, FetchError> {
        let path = self.path(kind);
        blocking(move || modified(&path)).await
    }

    async fn fetch(&self, kind: PayloadKind) -> Result<Fetched, FetchError> {
        let path = self.path(kind);
        blocking(move || {
            let validator = modified(&path)?;
            let bytes = std::fs::read(&path)?;
            Ok(Fetched { bytes, last_modified: validator.clone(), validator })
        })
        .await
    }
}

/// Transcript files on disk, in any layout [`read_transcripts`] accepts.
pub struct TranscriptDir {
    root: PathBuf,
}

impl TranscriptDir {
    pub fn new<P: AsRef<Path>>(root: P) -> Self { Self { root: root.as_ref().to_path_buf() } }
}

#[async_trait]
impl TranscriptSource for TranscriptDir {
    async fn transcripts(&self) -> Result<Vec<TranscriptDocument>, FetchError> {
        let root = self.root.clone();
        blocking(move || read_transcripts(&root).map_err(|e| FetchError::Unavailable(e.to_string()))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IndexBuilder;
    use crate::persist::{decode_dataset, save_payloads};
    use crate::tokenizer::Tokenizer;
    use crate::transcript::Panel;

    #[test]
    fn etag_wins_over_last_modified() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::LAST_MODIFIED, "Mon, 01 Jan 2001 00:00:00 GMT".parse().unwrap());
        assert_eq!(validator(&headers).as_deref(), Some("Mon, 01 Jan 2001 00:00:00 GMT"));
        headers.insert(header::ETAG, "\"abc\"".parse().unwrap());
        assert_eq!(validator(&headers).as_deref(), Some("\"abc\""));
        assert_eq!(validator(&header::HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn dir_source_serves_indexer_output() {
        let dir = tempfile::tempdir().unwrap();
        let docs = vec![TranscriptDocument {
            date: "2001-01-01".into(),
            panels: vec![Panel { panel: 1, dialogue: vec!["The boss is late".into()] }],
        }];
        let corpus = IndexBuilder::new(Tokenizer::default(), "v1").build(&docs).into();
        save_payloads(&IndexPaths::new(dir.path()), &corpus, false).unwrap();

        let source = DirSource::new(dir.path());
        let probed = source.probe(PayloadKind::Index).await.unwrap();
        let index = source.fetch(PayloadKind::Index).await.unwrap();
        let comics = source.fetch(PayloadKind::Comics).await.unwrap();
        assert!(probed.is_some());
        assert_eq!(index.validator, probed);
        assert_eq!(index.last_modified, probed);
        assert_eq!(decode_dataset(&index.bytes, &comics.bytes).unwrap(), corpus);
    }

    #[tokio::test]
    async fn missing_dir_payload_is_a_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirSource::new(dir.path().join("nope"));
        assert!(matches!(source.fetch(PayloadKind::Comics).await, Err(FetchError::Io(_))));
    }
}
