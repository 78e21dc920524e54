use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    static ref RE: Regex = Regex::new(r"(?u)[\p{L}\p{N}]+").expect("valid regex");
}

/// Conservative English stopword list. Kept short so that most words a
/// reader remembers from a strip stay searchable.
pub const DEFAULT_STOPWORDS: &[&str] = &[
    "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "of", "on", "or", "the", "to", "was", "with",
];

pub const DEFAULT_MIN_LEN: usize = 2;

/// Token with its byte range in the text it was taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSpan {
    pub term: String,
    pub start: usize,
    pub end: usize,
}

/// Word tokenizer shared by index build and query parsing.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    min_len: usize,
    stopwords: HashSet<String>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_LEN, DEFAULT_STOPWORDS.iter().copied())
    }
}

impl Tokenizer {
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(min_len: usize, stopwords: I) -> Self {
        Self { min_len, stopwords: stopwords.into_iter().map(|s| s.to_lowercase()).collect() }
    }

    fn normalize(&self, word: &str) -> Option<String> {
        let term = word.nfkc().collect::<String>().to_lowercase();
        if term.chars().count() < self.min_len || self.stopwords.contains(&term) {
            return None;
        }
        Some(term)
    }

    /// Split on non-alphanumeric boundaries, NFKC-normalize and lowercase each
    /// word, and drop short words and stopwords. Offsets refer to `text`.
    pub fn token_spans(&self, text: &str) -> Vec<TokenSpan> {
        RE.find_iter(text)
            .filter_map(|m| {
                self.normalize(m.as_str()).map(|term| TokenSpan { term, start: m.start(), end: m.end() })
            })
            .collect()
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        self.token_spans(text).into_iter().map(|t| t.term).collect()
    }

    /// Distinct terms in first-seen order.
    pub fn unique_terms(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tokenize(text).into_iter().filter(|t| seen.insert(t.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_punctuation() {
        let t = Tokenizer::default().tokenize("Boss! The boss's memo... 42 x");
        assert_eq!(t, vec!["boss", "boss", "memo", "42"]);
    }

    #[test]
    fn spans_point_into_input_text() {
        let text = "Hey, DILBERT!";
        let spans = Tokenizer::default().token_spans(text);
        assert_eq!(spans.len(), 2);
        assert_eq!(&text[spans[1].start..spans[1].end], "DILBERT");
        assert_eq!(spans[1].term, "dilbert");
    }

    #[test]
    fn unique_terms_keep_first_seen_order() {
        let t = Tokenizer::default().unique_terms("memo boss memo budget boss");
        assert_eq!(t, vec!["memo", "boss", "budget"]);
    }
}
