//! Startup loading and publication of the corpus.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::builder::{IndexBuilder, DEFAULT_BATCH_SIZE};
use crate::cache::{now_rfc3339, CachedMetadata, PersistentCache};
use crate::error::{LoadError, NotReady};
use crate::index::{Corpus, IndexMetadata};
use crate::persist::{decode_comics, decode_dataset};
use crate::search::{QueryEngine, ScoringWeights, SearchOptions, SearchPage, SearchResult};
use crate::source::{Fetched, PayloadKind, PayloadSource, TranscriptSource};
use crate::tokenizer::Tokenizer;
use crate::transcript::TranscriptDocument;
use crate::INDEX_FORMAT_VERSION;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Payloads of any other version are discarded.
    pub expected_version: String,
    pub index_key: String,
    pub comics_key: String,
    /// Documents indexed between scheduler yields during a rebuild.
    pub rebuild_batch_size: usize,
    pub weights: ScoringWeights,
    pub tokenizer: Tokenizer,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            expected_version: INDEX_FORMAT_VERSION.to_string(),
            index_key: "comic-search-index".to_string(),
            comics_key: "comic-transcripts".to_string(),
            rebuild_batch_size: DEFAULT_BATCH_SIZE,
            weights: ScoringWeights::default(),
            tokenizer: Tokenizer::default(),
        }
    }
}

impl LoaderConfig {
    fn key(&self, kind: PayloadKind) -> &str {
        match kind {
            PayloadKind::Index => &self.index_key,
            PayloadKind::Comics => &self.comics_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPath {
    CacheHit,
    NetworkRefresh,
    StaleFallback,
    Rebuilt,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub path: LoadPath,
    pub metadata: IndexMetadata,
    pub documents: usize,
    pub terms: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadStatus {
    Idle,
    Loading,
    Ready { path: LoadPath },
    Failed { error: String },
}

/// Tried in [`Strategy::ORDER`]; the first to produce a corpus wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ValidatedCache,
    NetworkRefresh,
    StaleCache,
    Rebuild,
}

impl Strategy {
    pub const ORDER: [Strategy; 4] =
        [Strategy::ValidatedCache, Strategy::NetworkRefresh, Strategy::StaleCache, Strategy::Rebuild];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::ValidatedCache => "validated-cache",
            Strategy::NetworkRefresh => "network-refresh",
            Strategy::StaleCache => "stale-cache",
            Strategy::Rebuild => "rebuild",
        }
    }

    pub fn path(&self) -> LoadPath {
        match self {
            Strategy::ValidatedCache => LoadPath::CacheHit,
            Strategy::NetworkRefresh => LoadPath::NetworkRefresh,
            Strategy::StaleCache => LoadPath::StaleFallback,
            Strategy::Rebuild => LoadPath::Rebuilt,
        }
    }
}

/// State carried between strategies of one load.
struct Attempt {
    /// Cached metadata for both payloads, present only when it matches the expected version.
    trusted: Option<(CachedMetadata, CachedMetadata)>,
    /// Comics payload downloaded by the network strategy, kept for a rebuild.
    fetched_comics: Option<Fetched>,
}

type Miss = String;
type Outcome = Option<Result<LoadReport, LoadError>>;

#[derive(Clone)]
struct Published {
    corpus: Arc<Corpus>,
    report: LoadReport,
}

struct Inner {
    config: LoaderConfig,
    source: Arc<dyn PayloadSource>,
    fallback: Option<Arc<dyn TranscriptSource>>,
    cache: PersistentCache,
    published: RwLock<Option<Published>>,
    inflight: Mutex<Option<watch::Receiver<Outcome>>>,
    status: watch::Sender<LoadStatus>,
}

/// Owner of the loaded corpus. Cheap to clone; clones share one corpus.
#[derive(Clone)]
pub struct ArchiveService {
    inner: Arc<Inner>,
}

impl ArchiveService {
    pub fn new(
        config: LoaderConfig,
        source: Arc<dyn PayloadSource>,
        cache: PersistentCache,
        fallback: Option<Arc<dyn TranscriptSource>>,
    ) -> Self {
        let (status, _) = watch::channel(LoadStatus::Idle);
        let inner = Inner {
            config,
            source,
            fallback,
            cache,
            published: RwLock::new(None),
            inflight: Mutex::new(None),
            status,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Load the corpus once. Concurrent callers share one in-flight load;
    /// once loaded, returns the existing report. Dropping the returned future
    /// does not cancel the load.
    pub async fn load(&self) -> Result<LoadReport, LoadError> {
        self.join_or_spawn(true).await
    }

    /// Run the load protocol again. Readers keep the current corpus until
    /// the new one replaces it.
    pub async fn reload(&self) -> Result<LoadReport, LoadError> {
        self.join_or_spawn(false).await
    }

    /// Re-index the transcripts of the current corpus and swap the result in.
    pub async fn rebuild(&self) -> Result<LoadReport, NotReady> {
        let current = self.corpus()?;
        let docs: Vec<TranscriptDocument> = current.store.documents().cloned().collect();
        let corpus = self.inner.build(&docs).await;
        tracing::info!(documents = corpus.store.len(), "administrative rebuild complete");
        Ok(self.inner.publish(corpus, LoadPath::Rebuilt))
    }

    pub fn is_ready(&self) -> bool { self.inner.published.read().is_some() }

    pub fn status(&self) -> LoadStatus { self.inner.status.borrow().clone() }

    /// Readiness signal; changes on every status transition.
    pub fn subscribe(&self) -> watch::Receiver<LoadStatus> { self.inner.status.subscribe() }

    pub fn report(&self) -> Option<LoadReport> {
        self.inner.published.read().as_ref().map(|p| p.report.clone())
    }

    pub fn corpus(&self) -> Result<Arc<Corpus>, NotReady> {
        self.inner.published.read().as_ref().map(|p| Arc::clone(&p.corpus)).ok_or(NotReady)
    }

    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>, NotReady> {
        Ok(self.search_page(query, options)?.results)
    }

    pub fn search_page(&self, query: &str, options: &SearchOptions) -> Result<SearchPage, NotReady> {
        let corpus = self.corpus()?;
        let config = &self.inner.config;
        Ok(QueryEngine::new(&corpus, &config.tokenizer, config.weights).search_page(query, options))
    }

    pub fn transcript(&self, date: &str) -> Result<Option<TranscriptDocument>, NotReady> {
        Ok(self.corpus()?.store.get(date).cloned())
    }

    /// Index words starting with the normalized `prefix`.
    pub fn suggest(&self, prefix: &str, limit: usize) -> Result<Vec<String>, NotReady> {
        let corpus = self.corpus()?;
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        Ok(corpus.index.terms_with_prefix(&prefix, limit).into_iter().cloned().collect())
    }

    async fn join_or_spawn(&self, reuse_ready: bool) -> Result<LoadReport, LoadError> {
        let rx = {
            let mut inflight = self.inner.inflight.lock();
            if reuse_ready {
                if let Some(report) = self.report() {
                    return Ok(report);
                }
            }
            match inflight.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let rx = self.spawn_load();
                    *inflight = Some(rx.clone());
                    rx
                }
            }
        };
        self.wait(rx).await
    }

    fn spawn_load(&self) -> watch::Receiver<Outcome> {
        let (tx, rx) = watch::channel(None);
        self.inner.status.send_replace(LoadStatus::Loading);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = match inner.run_protocol().await {
                Ok((corpus, path)) => Ok(inner.publish(corpus, path)),
                Err(e) => {
                    inner.fail(&e);
                    Err(e)
                }
            };
            *inner.inflight.lock() = None;
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    async fn wait(&self, mut rx: watch::Receiver<Outcome>) -> Result<LoadReport, LoadError> {
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone(),
            Err(_) => None,
        };
        match outcome {
            Some(result) => result,
            None => {
                // The load task went away without reporting; let the next caller start over.
                let mut inflight = self.inner.inflight.lock();
                if inflight.as_ref().map_or(false, |r| r.same_channel(&rx)) {
                    *inflight = None;
                }
                Err(LoadError::Aborted)
            }
        }
    }
}

impl Inner {
    fn publish(&self, corpus: Corpus, path: LoadPath) -> LoadReport {
        let report = LoadReport {
            path,
            metadata: corpus.metadata.clone(),
            documents: corpus.store.len(),
            terms: corpus.index.len(),
        };
        *self.published.write() = Some(Published { corpus: Arc::new(corpus), report: report.clone() });
        self.status.send_replace(LoadStatus::Ready { path });
        report
    }

    fn fail(&self, error: &LoadError) {
        let previous = self.published.read().as_ref().map(|p| p.report.path);
        match previous {
            Some(path) => {
                tracing::warn!(error = %error, "reload failed; keeping the loaded archive");
                self.status.send_replace(LoadStatus::Ready { path });
            }
            None => {
                tracing::error!(error = %error, "archive unavailable");
                self.status.send_replace(LoadStatus::Failed { error: error.to_string() });
            }
        }
    }

    async fn run_protocol(&self) -> Result<(Corpus, LoadPath), LoadError> {
        let mut attempt = Attempt { trusted: self.read_local_metadata().await, fetched_comics: None };
        let mut attempts = Vec::new();
        for strategy in Strategy::ORDER {
            tracing::debug!(strategy = strategy.name(), "trying load strategy");
            let result = match strategy {
                Strategy::ValidatedCache => self.validated_cache(&attempt).await,
                Strategy::NetworkRefresh => self.network_refresh(&mut attempt).await,
                Strategy::StaleCache => self.stale_cache(&attempt).await,
                Strategy::Rebuild => self.rebuild(&attempt).await,
            };
            match result {
                Ok(corpus) => {
                    tracing::info!(
                        strategy = strategy.name(),
                        path = ?strategy.path(),
                        version = %corpus.metadata.version,
                        documents = corpus.store.len(),
                        terms = corpus.index.len(),
                        "archive loaded"
                    );
                    return Ok((corpus, strategy.path()));
                }
                Err(reason) => {
                    tracing::warn!(strategy = strategy.name(), %reason, "load strategy missed");
                    attempts.push(format!("{}: {}", strategy.name(), reason));
                }
            }
        }
        Err(LoadError::Exhausted { attempts })
    }

    /// Cached metadata for both payloads if it is at the expected version.
    /// Entries at any other version, or half a pair, are invalidated.
    async fn read_local_metadata(&self) -> Option<(CachedMetadata, CachedMetadata)> {
        let expected = &self.config.expected_version;
        let index = self.cache.metadata(&self.config.index_key);
        let comics = self.cache.metadata(&self.config.comics_key);
        match (index, comics) {
            (Some(i), Some(c)) if &i.version == expected && &c.version == expected => Some((i, c)),
            (None, None) => None,
            (i, c) => {
                tracing::info!(
                    expected = %expected,
                    index = ?i.map(|m| m.version),
                    comics = ?c.map(|m| m.version),
                    "cached payloads do not match this build; invalidating"
                );
                for kind in PayloadKind::ALL {
                    self.cache.invalidate(self.config.key(kind)).await;
                }
                None
            }
        }
    }

    async fn validated_cache(&self, attempt: &Attempt) -> Result<Corpus, Miss> {
        let (index_meta, comics_meta) = attempt.trusted.as_ref().ok_or("no cached payload for this version")?;
        for (kind, meta) in [(PayloadKind::Index, index_meta), (PayloadKind::Comics, comics_meta)] {
            let current = self
                .source
                .probe(kind)
                .await
                .map_err(|e| format!("freshness probe for {} failed: {e}", kind.as_str()))?;
            match (current, meta.validator.as_ref()) {
                (Some(now), Some(cached)) if &now == cached => {}
                (Some(_), Some(_)) => return Err(format!("source has a newer {} payload", kind.as_str())),
                _ => return Err(format!("no validator to compare for {} payload", kind.as_str())),
            }
        }
        self.cached_corpus(index_meta).await
    }

    async fn network_refresh(&self, attempt: &mut Attempt) -> Result<Corpus, Miss> {
        let (index, comics) = tokio::join!(self.source.fetch(PayloadKind::Index), self.source.fetch(PayloadKind::Comics));
        let comics = comics.map_err(|e| format!("comics fetch failed: {e}"))?;
        let comics = attempt.fetched_comics.insert(comics);
        let index = index.map_err(|e| format!("index fetch failed: {e}"))?;

        let mut corpus = decode_dataset(&index.bytes, &comics.bytes).map_err(|e| format!("payload rejected: {e}"))?;
        self.check_version(&corpus)?;
        corpus.metadata.source_last_modified = index.last_modified.clone();

        let cached_at = now_rfc3339();
        let record = |fetched: &Fetched| CachedMetadata {
            version: corpus.metadata.version.clone(),
            generated_at: corpus.metadata.generated_at.clone(),
            cached_at: cached_at.clone(),
            validator: fetched.validator.clone(),
            last_modified: fetched.last_modified.clone(),
        };
        let index_record = record(&index);
        let comics_record = record(&*comics);
        let stored = self.cache.put(&self.config.index_key, index.bytes, index_record).await
            && self.cache.put(&self.config.comics_key, comics.bytes.clone(), comics_record).await;
        if !stored {
            // Half a pair in the cache is worse than none.
            for kind in PayloadKind::ALL {
                self.cache.invalidate(self.config.key(kind)).await;
            }
        }
        Ok(corpus)
    }

    async fn stale_cache(&self, attempt: &Attempt) -> Result<Corpus, Miss> {
        let (index_meta, _) = attempt.trusted.as_ref().ok_or("no cached payload for this version")?;
        self.cached_corpus(index_meta).await
    }

    async fn rebuild(&self, attempt: &Attempt) -> Result<Corpus, Miss> {
        let docs = self.rebuild_input(attempt).await.ok_or("no transcripts available")?;
        let corpus = self.build(&docs).await;
        if corpus.store.is_empty() {
            return Err("no usable transcripts".into());
        }
        Ok(corpus)
    }

    /// First non-empty transcript set among: the freshly fetched comics
    /// payload, the cached comics payload, the fallback transcript source.
    async fn rebuild_input(&self, attempt: &Attempt) -> Option<Vec<TranscriptDocument>> {
        if let Some(fetched) = &attempt.fetched_comics {
            match decode_comics(&fetched.bytes) {
                Ok((_, docs)) if !docs.is_empty() => return Some(docs),
                Ok(_) => tracing::debug!("fetched comics payload is empty"),
                Err(e) => tracing::warn!(error = %e, "fetched comics payload unusable for rebuild"),
            }
        }
        if attempt.trusted.is_some() {
            if let Some(entry) = self.cache.get(&self.config.comics_key).await {
                match decode_comics(&entry.payload) {
                    Ok((_, docs)) if !docs.is_empty() => return Some(docs),
                    Ok(_) => tracing::debug!("cached comics payload is empty"),
                    Err(e) => tracing::warn!(error = %e, "cached comics payload unusable for rebuild"),
                }
            }
        }
        if let Some(fallback) = &self.fallback {
            match fallback.transcripts().await {
                Ok(docs) if !docs.is_empty() => return Some(docs),
                Ok(_) => tracing::debug!("fallback transcript source is empty"),
                Err(e) => tracing::warn!(error = %e, "fallback transcript source failed"),
            }
        }
        None
    }

    async fn build(&self, docs: &[TranscriptDocument]) -> Corpus {
        IndexBuilder::new(self.config.tokenizer.clone(), self.config.expected_version.clone())
            .build_yielding(docs, self.config.rebuild_batch_size)
            .await
            .into()
    }

    async fn cached_corpus(&self, index_meta: &CachedMetadata) -> Result<Corpus, Miss> {
        let index = self.cache.get(&self.config.index_key).await.ok_or("index payload missing from cache")?;
        let comics = self.cache.get(&self.config.comics_key).await.ok_or("comics payload missing from cache")?;
        let mut corpus =
            decode_dataset(&index.payload, &comics.payload).map_err(|e| format!("cached payload rejected: {e}"))?;
        self.check_version(&corpus)?;
        corpus.metadata.source_last_modified = index_meta.last_modified.clone();
        Ok(corpus)
    }

    fn check_version(&self, corpus: &Corpus) -> Result<(), Miss> {
        if corpus.metadata.version != self.config.expected_version {
            return Err(format!(
                "payload version {} does not match expected {}",
                corpus.metadata.version, self.config.expected_version
            ));
        }
        Ok(())
    }
}
