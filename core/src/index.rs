use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::builder::BuildOutput;
use crate::transcript::{DateKey, TranscriptStore};

/// Word → dates containing it. Posting lists keep first-seen order; lookups
/// treat them as sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvertedIndex {
    postings: BTreeMap<String, Vec<DateKey>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub version: String,
    /// RFC 3339
    pub generated_at: String,
    pub total_documents: usize,
    /// Distinct tokens in the index.
    pub total_words: usize,
    /// Last-Modified of the index payload as reported by its source.
    #[serde(default)]
    pub source_last_modified: Option<String>,
}

impl InvertedIndex {
    pub fn new() -> Self { Self::default() }

    pub fn from_postings(postings: BTreeMap<String, Vec<DateKey>>) -> Self { Self { postings } }

    pub fn postings(&self, term: &str) -> &[DateKey] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_term(&self, term: &str) -> bool { self.postings.contains_key(term) }

    pub fn terms(&self) -> impl Iterator<Item = &String> { self.postings.keys() }

    pub fn len(&self) -> usize { self.postings.len() }

    pub fn is_empty(&self) -> bool { self.postings.is_empty() }

    /// Every date referenced by any posting list.
    pub fn dates(&self) -> BTreeSet<&DateKey> { self.postings.values().flatten().collect() }

    /// Terms starting with `prefix`, in alphabetical order.
    pub fn terms_with_prefix(&self, prefix: &str, limit: usize) -> Vec<&String> {
        self.postings
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, _)| k)
            .collect()
    }

    pub(crate) fn push(&mut self, term: String, date: DateKey) {
        self.postings.entry(term).or_default().push(date);
    }

    pub(crate) fn retain_dates<F: FnMut(&str) -> bool>(&mut self, mut keep: F) -> usize {
        let mut dropped = 0;
        for list in self.postings.values_mut() {
            let before = list.len();
            list.retain(|d| keep(d));
            dropped += before - list.len();
        }
        self.postings.retain(|_, list| !list.is_empty());
        dropped
    }

    pub(crate) fn as_map(&self) -> &BTreeMap<String, Vec<DateKey>> { &self.postings }
}

/// An index together with the transcripts it points into, at one version.
#[derive(Debug, Clone, PartialEq)]
pub struct Corpus {
    pub index: InvertedIndex,
    pub store: TranscriptStore,
    pub metadata: IndexMetadata,
}

impl Corpus {
    /// Postings that reference dates missing from `store` are dropped.
    pub fn new(mut index: InvertedIndex, store: TranscriptStore, metadata: IndexMetadata) -> Self {
        let dropped = index.retain_dates(|d| store.contains(d));
        if dropped > 0 {
            tracing::warn!(dropped, "dropped postings without a transcript");
        }
        Self { index, store, metadata }
    }
}

impl From<BuildOutput> for Corpus {
    fn from(out: BuildOutput) -> Self { Corpus::new(out.index, out.store, out.metadata) }
}
