use std::collections::{BTreeMap, HashSet};
use time::format_description::well_known::Rfc3339;

use crate::error::MalformedDocument;
use crate::index::{IndexMetadata, InvertedIndex};
use crate::tokenizer::Tokenizer;
use crate::transcript::{DateKey, TranscriptDocument, TranscriptStore};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub index: InvertedIndex,
    pub metadata: IndexMetadata,
    pub store: TranscriptStore,
    pub skipped: Vec<MalformedDocument>,
}

/// Builds document-level inverted indexes from transcripts.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    tokenizer: Tokenizer,
    version: String,
    generated_at: Option<String>,
}

impl IndexBuilder {
    pub fn new(tokenizer: Tokenizer, version: impl Into<String>) -> Self {
        Self { tokenizer, version: version.into(), generated_at: None }
    }

    /// Pin the `generated_at` stamp instead of using the current time.
    pub fn generated_at(mut self, ts: impl Into<String>) -> Self {
        self.generated_at = Some(ts.into());
        self
    }

    pub fn build(&self, docs: &[TranscriptDocument]) -> BuildOutput {
        let (ordered, skipped) = prepare(docs);
        let mut acc = Accumulator::default();
        for doc in &ordered {
            acc.add(&self.tokenizer, doc);
        }
        self.finish(acc, ordered, skipped)
    }

    /// Same output as [`IndexBuilder::build`], yielding to the scheduler
    /// between batches so a large rebuild does not starve other tasks.
    pub async fn build_yielding(&self, docs: &[TranscriptDocument], batch_size: usize) -> BuildOutput {
        let (ordered, skipped) = prepare(docs);
        let mut acc = Accumulator::default();
        for batch in ordered.chunks(batch_size.max(1)) {
            for doc in batch {
                acc.add(&self.tokenizer, doc);
            }
            tokio::task::yield_now().await;
        }
        self.finish(acc, ordered, skipped)
    }

    fn finish(&self, acc: Accumulator, ordered: Vec<TranscriptDocument>, skipped: Vec<MalformedDocument>) -> BuildOutput {
        let generated_at = self.generated_at.clone().unwrap_or_else(|| {
            time::OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
        });
        let metadata = IndexMetadata {
            version: self.version.clone(),
            generated_at,
            total_documents: acc.documents,
            total_words: acc.index.len(),
            source_last_modified: None,
        };
        tracing::info!(
            num_docs = metadata.total_documents,
            num_terms = metadata.total_words,
            skipped = skipped.len(),
            "index build complete"
        );
        BuildOutput { index: acc.index, metadata, store: TranscriptStore::from_documents(ordered), skipped }
    }
}

/// Validate, dedupe by date (last wins) and order by date.
fn prepare(docs: &[TranscriptDocument]) -> (Vec<TranscriptDocument>, Vec<MalformedDocument>) {
    let mut valid: BTreeMap<DateKey, TranscriptDocument> = BTreeMap::new();
    let mut skipped = Vec::new();
    for doc in docs {
        match doc.validate() {
            Ok(()) => {
                valid.insert(doc.date.clone(), doc.clone());
            }
            Err(e) => {
                tracing::warn!(date = %e.date, reason = %e.reason, "skipping malformed transcript");
                skipped.push(e);
            }
        }
    }
    (valid.into_values().collect(), skipped)
}

#[derive(Default)]
struct Accumulator {
    index: InvertedIndex,
    documents: usize,
}

impl Accumulator {
    fn add(&mut self, tokenizer: &Tokenizer, doc: &TranscriptDocument) {
        let mut seen_in_doc: HashSet<String> = HashSet::new();
        for (_, _, line) in doc.lines() {
            for term in tokenizer.tokenize(line) {
                if seen_in_doc.insert(term.clone()) {
                    self.index.push(term, doc.date.clone());
                }
            }
        }
        self.documents += 1;
    }
}
