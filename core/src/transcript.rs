use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::ops::Bound;
use std::path::Path;
use time::macros::format_description;
use walkdir::WalkDir;

use crate::error::MalformedDocument;

/// ISO calendar date (`YYYY-MM-DD`) identifying one archived strip.
pub type DateKey = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Panel {
    pub panel: u32,
    pub dialogue: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptDocument {
    pub date: DateKey,
    pub panels: Vec<Panel>,
}

impl TranscriptDocument {
    pub fn validate(&self) -> Result<(), MalformedDocument> {
        let fail = |reason: &str| MalformedDocument { date: self.date.clone(), reason: reason.to_string() };
        if !is_date_key(&self.date) {
            return Err(fail("date is not an ISO calendar date"));
        }
        if self.panels.is_empty() {
            return Err(fail("no panels"));
        }
        let has_text = self
            .panels
            .iter()
            .flat_map(|p| p.dialogue.iter())
            .any(|line| !line.trim().is_empty());
        if !has_text {
            return Err(fail("no dialogue"));
        }
        Ok(())
    }

    /// Every dialogue line with the panel it belongs to and its position in that panel.
    pub fn lines(&self) -> impl Iterator<Item = (u32, usize, &str)> + '_ {
        self.panels
            .iter()
            .flat_map(|p| p.dialogue.iter().enumerate().map(move |(i, l)| (p.panel, i, l.as_str())))
    }
}

pub fn is_date_key(s: &str) -> bool {
    s.len() == 10 && time::Date::parse(s, format_description!("[year]-[month]-[day]")).is_ok()
}

/// All transcripts of the archive keyed by date. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptStore {
    docs: BTreeMap<DateKey, TranscriptDocument>,
}

impl TranscriptStore {
    pub fn new() -> Self { Self::default() }

    /// Later documents replace earlier ones with the same date.
    pub fn from_documents<I: IntoIterator<Item = TranscriptDocument>>(docs: I) -> Self {
        let docs = docs.into_iter().map(|d| (d.date.clone(), d)).collect();
        Self { docs }
    }

    pub fn get(&self, date: &str) -> Option<&TranscriptDocument> { self.docs.get(date) }

    pub fn contains(&self, date: &str) -> bool { self.docs.contains_key(date) }

    pub fn len(&self) -> usize { self.docs.len() }

    pub fn is_empty(&self) -> bool { self.docs.is_empty() }

    pub fn dates(&self) -> impl Iterator<Item = &DateKey> { self.docs.keys() }

    pub fn documents(&self) -> impl Iterator<Item = &TranscriptDocument> { self.docs.values() }

    pub fn first_date(&self) -> Option<&DateKey> { self.docs.keys().next() }

    pub fn last_date(&self) -> Option<&DateKey> { self.docs.keys().next_back() }

    /// Closest archived date strictly before `date`.
    pub fn previous(&self, date: &str) -> Option<&DateKey> {
        self.docs
            .range::<str, _>((Bound::Unbounded, Bound::Excluded(date)))
            .next_back()
            .map(|(k, _)| k)
    }

    /// Closest archived date strictly after `date`.
    pub fn next(&self, date: &str) -> Option<&DateKey> {
        self.docs
            .range::<str, _>((Bound::Excluded(date), Bound::Unbounded))
            .next()
            .map(|(k, _)| k)
    }
}

/// Inclusive date range check; `None` bounds are open. DateKeys compare lexically.
pub fn within(date: &str, from: Option<&str>, to: Option<&str>) -> bool {
    from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t)
}

/// Read transcripts from a `.json`/`.jsonl` file or a directory of them.
///
/// A JSON file may hold one document, an array of documents, or a map of
/// date to document. Entries that do not decode are skipped with a warning.
pub fn read_transcripts<P: AsRef<Path>>(input: P) -> Result<Vec<TranscriptDocument>> {
    let input = input.as_ref();
    let mut files = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() && matches!(p.extension().and_then(|s| s.to_str()), Some("json" | "jsonl")) {
                files.push(p.to_path_buf());
            }
        }
    } else if input.is_file() {
        files.push(input.to_path_buf());
    }

    let mut docs = Vec::new();
    for file in files {
        if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
            let reader = BufReader::new(File::open(&file)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() { continue; }
                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(v) => push_document(v, None, &mut docs),
                    Err(e) => tracing::warn!(file = %file.display(), error = %e, "skipping undecodable line"),
                }
            }
        } else {
            let text = fs::read_to_string(&file)?;
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(v) => collect_documents(v, &mut docs),
                Err(e) => tracing::warn!(file = %file.display(), error = %e, "skipping undecodable file"),
            }
        }
    }
    Ok(docs)
}

fn collect_documents(value: serde_json::Value, docs: &mut Vec<TranscriptDocument>) {
    match value {
        serde_json::Value::Array(arr) => {
            for v in arr { push_document(v, None, docs); }
        }
        serde_json::Value::Object(map) if map.contains_key("panels") => {
            push_document(serde_json::Value::Object(map), None, docs);
        }
        serde_json::Value::Object(map) => {
            for (date, v) in map { push_document(v, Some(date), docs); }
        }
        _ => {}
    }
}

fn push_document(mut value: serde_json::Value, date: Option<String>, docs: &mut Vec<TranscriptDocument>) {
    if let (Some(date), serde_json::Value::Object(obj)) = (date, &mut value) {
        obj.entry("date").or_insert(serde_json::Value::String(date));
    }
    match serde_json::from_value::<TranscriptDocument>(value) {
        Ok(doc) => docs.push(doc),
        Err(e) => tracing::warn!(error = %e, "skipping undecodable transcript"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(date: &str, lines: &[&str]) -> TranscriptDocument {
        TranscriptDocument {
            date: date.into(),
            panels: vec![Panel { panel: 1, dialogue: lines.iter().map(|s| s.to_string()).collect() }],
        }
    }

    #[test]
    fn validates_dates_and_content() {
        assert!(doc("2001-01-01", &["hi there"]).validate().is_ok());
        assert!(doc("2001-02-30", &["hi"]).validate().is_err());
        assert!(doc("01-01-2001", &["hi"]).validate().is_err());
        assert!(doc("2001-01-01", &["   "]).validate().is_err());
        let empty = TranscriptDocument { date: "2001-01-01".into(), panels: vec![] };
        assert_eq!(empty.validate().unwrap_err().reason, "no panels");
    }

    #[test]
    fn navigates_between_dates() {
        let store = TranscriptStore::from_documents(vec![
            doc("2001-01-03", &["c"]),
            doc("2001-01-01", &["a"]),
            doc("2001-01-02", &["b"]),
        ]);
        assert_eq!(store.first_date().map(String::as_str), Some("2001-01-01"));
        assert_eq!(store.last_date().map(String::as_str), Some("2001-01-03"));
        assert_eq!(store.next("2001-01-01").map(String::as_str), Some("2001-01-02"));
        assert_eq!(store.previous("2001-01-02").map(String::as_str), Some("2001-01-01"));
        assert_eq!(store.previous("2001-01-01"), None);
        assert_eq!(store.next("2001-01-03"), None);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        assert!(within("2001-01-01", Some("2001-01-01"), Some("2001-01-01")));
        assert!(!within("2001-01-02", None, Some("2001-01-01")));
        assert!(within("2001-01-02", None, None));
    }

    #[test]
    fn reads_map_array_and_jsonl_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"{"2001-01-01": {"panels": [{"panel": 1, "dialogue": ["one"]}]},
                "2001-01-02": {"panels": [{"panel": 1}]}}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("b.json"),
            r#"[{"date": "2001-01-03", "panels": [{"panel": 1, "dialogue": ["three"]}]}]"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("c.jsonl"),
            "{\"date\": \"2001-01-04\", \"panels\": [{\"panel\": 2, \"dialogue\": [\"four\"]}]}\nnot json\n",
        )
        .unwrap();
        let docs = read_transcripts(dir.path()).unwrap();
        let dates: Vec<_> = docs.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(dates, vec!["2001-01-01", "2001-01-03", "2001-01-04"]);
    }
}
