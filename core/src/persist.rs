use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::PayloadError;
use crate::index::{Corpus, IndexMetadata, InvertedIndex};
use crate::transcript::{DateKey, TranscriptDocument, TranscriptStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadStats {
    pub total_comics: usize,
    pub total_words: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexPayload {
    version: String,
    generated_at: String,
    stats: PayloadStats,
    word_index: InvertedIndex,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComicsPayload {
    version: String,
    #[serde(default)]
    generated_at: Option<String>,
    comics: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CombinedPayload {
    version: String,
    generated_at: String,
    stats: PayloadStats,
    word_index: InvertedIndex,
    comics: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadOut<'a> {
    version: &'a str,
    generated_at: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<PayloadStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    word_index: Option<&'a BTreeMap<String, Vec<DateKey>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comics: Option<BTreeMap<&'a DateKey, &'a TranscriptDocument>>,
}

impl<'a> PayloadOut<'a> {
    fn header(corpus: &'a Corpus) -> Self {
        Self {
            version: &corpus.metadata.version,
            generated_at: &corpus.metadata.generated_at,
            stats: None,
            word_index: None,
            comics: None,
        }
    }

    fn with_index(mut self, corpus: &'a Corpus) -> Self {
        self.stats = Some(PayloadStats { total_comics: corpus.store.len(), total_words: corpus.index.len() });
        self.word_index = Some(corpus.index.as_map());
        self
    }

    fn with_comics(mut self, corpus: &'a Corpus) -> Self {
        self.comics = Some(corpus.store.documents().map(|d| (&d.date, d)).collect());
        self
    }
}

/// `{version, generatedAt, stats, wordIndex}`
pub fn encode_index(corpus: &Corpus) -> Result<Vec<u8>, serde_json::Error> {
    to_bytes(&PayloadOut::header(corpus).with_index(corpus))
}

/// `{version, generatedAt, comics}`
pub fn encode_comics(corpus: &Corpus) -> Result<Vec<u8>, serde_json::Error> {
    to_bytes(&PayloadOut::header(corpus).with_comics(corpus))
}

/// Single-file variant carrying both halves.
pub fn encode_combined(corpus: &Corpus) -> Result<Vec<u8>, serde_json::Error> {
    to_bytes(&PayloadOut::header(corpus).with_index(corpus).with_comics(corpus))
}

fn to_bytes(out: &PayloadOut<'_>) -> Result<Vec<u8>, serde_json::Error> {
    // Maps are BTreeMaps, so the output is byte-stable for equal corpora.
    serde_json::to_vec(out)
}

/// Decode the split payload pair into one consistent corpus.
pub fn decode_dataset(index_bytes: &[u8], comics_bytes: &[u8]) -> Result<Corpus, PayloadError> {
    let index: IndexPayload = serde_json::from_slice(index_bytes)?;
    let comics: ComicsPayload = serde_json::from_slice(comics_bytes)?;
    if index.version != comics.version {
        return Err(PayloadError::VersionSkew { index: index.version, comics: comics.version });
    }
    let store = TranscriptStore::from_documents(decode_comic_map(comics.comics));
    Ok(assemble(index.version, index.generated_at, index.stats, index.word_index, store))
}

pub fn decode_combined(bytes: &[u8]) -> Result<Corpus, PayloadError> {
    let payload: CombinedPayload = serde_json::from_slice(bytes)?;
    let store = TranscriptStore::from_documents(decode_comic_map(payload.comics));
    Ok(assemble(payload.version, payload.generated_at, payload.stats, payload.word_index, store))
}

/// Transcripts of a comics payload, for rebuilding the index without its
/// index half. Returns the payload version alongside.
pub fn decode_comics(bytes: &[u8]) -> Result<(String, Vec<TranscriptDocument>), PayloadError> {
    let comics: ComicsPayload = serde_json::from_slice(bytes)?;
    if let Some(ts) = &comics.generated_at {
        tracing::debug!(version = %comics.version, generated_at = %ts, "decoded comics payload");
    }
    Ok((comics.version, decode_comic_map(comics.comics)))
}

fn assemble(version: String, generated_at: String, stats: PayloadStats, index: InvertedIndex, store: TranscriptStore) -> Corpus {
    if stats.total_comics != store.len() || stats.total_words != index.len() {
        tracing::debug!(
            stated_comics = stats.total_comics,
            stated_words = stats.total_words,
            comics = store.len(),
            words = index.len(),
            "payload stats differ from decoded content"
        );
    }
    let mut corpus = Corpus::new(
        index,
        store,
        IndexMetadata { version, generated_at, total_documents: 0, total_words: 0, source_last_modified: None },
    );
    corpus.metadata.total_documents = corpus.store.len();
    corpus.metadata.total_words = corpus.index.len();
    corpus
}

fn decode_comic_map(comics: BTreeMap<String, serde_json::Value>) -> Vec<TranscriptDocument> {
    let mut docs = Vec::with_capacity(comics.len());
    for (key, value) in comics {
        match serde_json::from_value::<TranscriptDocument>(value) {
            Ok(doc) if doc.date == key => docs.push(doc),
            Ok(doc) => tracing::warn!(key = %key, date = %doc.date, "skipping transcript filed under another date"),
            Err(e) => tracing::warn!(key = %key, error = %e, "skipping undecodable transcript"),
        }
    }
    docs
}

/// Files written by the offline indexer and read by [`crate::source::DirSource`].
pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    pub fn index(&self) -> PathBuf { self.root.join("search-index.json") }
    pub fn comics(&self) -> PathBuf { self.root.join("comics-database.json") }
    pub fn combined(&self) -> PathBuf { self.root.join("archive.json") }
    pub fn meta(&self) -> PathBuf { self.root.join("meta.json") }
}

/// Write both payload halves and `meta.json`; with `combined`, also the single-file variant.
pub fn save_payloads(paths: &IndexPaths, corpus: &Corpus, combined: bool) -> Result<()> {
    create_dir_all(&paths.root)?;
    write_file(&paths.index(), &encode_index(corpus)?)?;
    write_file(&paths.comics(), &encode_comics(corpus)?)?;
    if combined {
        write_file(&paths.combined(), &encode_combined(corpus)?)?;
    }
    save_meta(paths, &corpus.metadata)
}

pub fn load_payloads(paths: &IndexPaths) -> Result<Corpus> {
    let index = read_file(&paths.index())?;
    let comics = read_file(&paths.comics())?;
    Ok(decode_dataset(&index, &comics)?)
}

pub fn save_meta(paths: &IndexPaths, meta: &IndexMetadata) -> Result<()> {
    create_dir_all(&paths.root)?;
    let json = serde_json::to_string_pretty(meta)?;
    write_file(&paths.meta(), json.as_bytes())
}

pub fn load_meta(paths: &IndexPaths) -> Result<IndexMetadata> {
    let buf = read_file(&paths.meta())?;
    let meta: IndexMetadata = serde_json::from_slice(&buf)?;
    Ok(meta)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut f = File::create(path)?;
    f.write_all(bytes)?;
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    Ok(buf)
}
