use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use crate::index::Corpus;
use crate::tokenizer::Tokenizer;
use crate::transcript::{within, DateKey, TranscriptDocument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Every query word must occur in the strip.
    #[default]
    All,
    /// Any query word may occur.
    Any,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub mode: MatchMode,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Inclusive date bounds.
    pub from: Option<DateKey>,
    pub to: Option<DateKey>,
}

/// score = term_frequency * (query word occurrences) + phrase_bonus * (lines containing the whole query)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub term_frequency: f32,
    pub phrase_bonus: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self { Self { term_frequency: 1.0, phrase_bonus: 5.0 } }
}

/// A dialogue line with the byte ranges that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Excerpt {
    pub text: String,
    pub highlights: Vec<(usize, usize)>,
}

impl Excerpt {
    /// The line with every highlight wrapped in `open`/`close`.
    pub fn marked(&self, open: &str, close: &str) -> String {
        let mut out = String::with_capacity(self.text.len() + self.highlights.len() * (open.len() + close.len()));
        let mut last = 0;
        for &(start, end) in &self.highlights {
            out.push_str(&self.text[last..start]);
            out.push_str(open);
            out.push_str(&self.text[start..end]);
            out.push_str(close);
            last = end;
        }
        out.push_str(&self.text[last..]);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelMatch {
    pub panel: u32,
    /// Position of the line within the panel's dialogue.
    pub line: usize,
    pub excerpt: Excerpt,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub date: DateKey,
    pub score: f32,
    pub matched_panels: Vec<PanelMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    /// Matches before offset/limit were applied.
    pub total_hits: usize,
    pub results: Vec<SearchResult>,
}

/// Answers queries against one loaded corpus.
pub struct QueryEngine<'a> {
    corpus: &'a Corpus,
    tokenizer: &'a Tokenizer,
    weights: ScoringWeights,
}

impl<'a> QueryEngine<'a> {
    pub fn new(corpus: &'a Corpus, tokenizer: &'a Tokenizer, weights: ScoringWeights) -> Self {
        Self { corpus, tokenizer, weights }
    }

    pub fn search(&self, query: &str, options: &SearchOptions) -> Vec<SearchResult> {
        self.search_page(query, options).results
    }

    pub fn search_page(&self, query: &str, options: &SearchOptions) -> SearchPage {
        let terms = self.tokenizer.unique_terms(query);
        if terms.is_empty() {
            return SearchPage { total_hits: 0, results: Vec::new() };
        }
        let phrase = normalize_phrase(query);
        let wanted: HashSet<&str> = terms.iter().map(String::as_str).collect();

        let mut results: Vec<SearchResult> = self
            .candidates(&terms, options.mode)
            .into_iter()
            .filter(|date| within(date, options.from.as_deref(), options.to.as_deref()))
            .filter_map(|date| self.corpus.store.get(date))
            .filter_map(|doc| self.score(doc, &wanted, &phrase))
            .collect();

        results.sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal).then_with(|| a.date.cmp(&b.date))
        });
        let total_hits = results.len();
        let results = results
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        SearchPage { total_hits, results }
    }

    fn candidates(&self, terms: &[String], mode: MatchMode) -> BTreeSet<&'a DateKey> {
        let corpus: &'a Corpus = self.corpus;
        let index = &corpus.index;
        match mode {
            MatchMode::Any => terms.iter().flat_map(|t| index.postings(t)).collect(),
            MatchMode::All => {
                let mut lists: Vec<&'a [DateKey]> = terms.iter().map(|t| index.postings(t)).collect();
                lists.sort_by_key(|l| l.len());
                let mut survivors: BTreeSet<&'a DateKey> = match lists.first() {
                    Some(first) => first.iter().collect(),
                    None => return BTreeSet::new(),
                };
                for list in &lists[1..] {
                    let set: HashSet<&DateKey> = list.iter().collect();
                    survivors.retain(|d| set.contains(d));
                    if survivors.is_empty() {
                        break;
                    }
                }
                survivors
            }
        }
    }

    fn score(&self, doc: &TranscriptDocument, wanted: &HashSet<&str>, phrase: &str) -> Option<SearchResult> {
        let mut term_hits = 0usize;
        let mut phrase_lines = 0usize;
        let mut matched_panels = Vec::new();

        for (panel, line_no, line) in doc.lines() {
            let mut spans: Vec<(usize, usize)> = self
                .tokenizer
                .token_spans(line)
                .into_iter()
                .filter(|t| wanted.contains(t.term.as_str()))
                .map(|t| (t.start, t.end))
                .collect();
            term_hits += spans.len();

            if !phrase.is_empty() {
                let phrase_spans = phrase_matches(line, phrase);
                if !phrase_spans.is_empty() {
                    phrase_lines += 1;
                }
                spans.extend(phrase_spans);
            }

            if !spans.is_empty() {
                matched_panels.push(PanelMatch {
                    panel,
                    line: line_no,
                    excerpt: Excerpt { text: line.to_string(), highlights: merge_spans(spans) },
                });
            }
        }

        if matched_panels.is_empty() {
            return None;
        }
        let score = self.weights.term_frequency * term_hits as f32 + self.weights.phrase_bonus * phrase_lines as f32;
        Some(SearchResult { date: doc.date.clone(), score, matched_panels })
    }
}

/// Lowercased query with runs of whitespace collapsed to one space.
fn normalize_phrase(query: &str) -> String {
    lowercase(query).split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Char-by-char lowercasing, so lowered byte offsets can be mapped back.
fn lowercase(text: &str) -> String {
    text.chars().flat_map(char::to_lowercase).collect()
}

/// Byte ranges of `line` holding whole-word occurrences of `phrase`,
/// compared case-insensitively.
fn phrase_matches(line: &str, phrase: &str) -> Vec<(usize, usize)> {
    // source[k] is the byte range in `line` of the char that produced lowered byte k
    let mut lower = String::with_capacity(line.len());
    let mut source: Vec<(usize, usize)> = Vec::with_capacity(line.len());
    for (start, c) in line.char_indices() {
        let end = start + c.len_utf8();
        for lc in c.to_lowercase() {
            lower.push(lc);
            source.extend(std::iter::repeat((start, end)).take(lc.len_utf8()));
        }
    }

    let guard_start = phrase.chars().next().map_or(false, char::is_alphanumeric);
    let guard_end = phrase.chars().next_back().map_or(false, char::is_alphanumeric);
    lower
        .match_indices(phrase)
        .filter(|&(i, m)| {
            let before = lower[..i].chars().next_back();
            let after = lower[i + m.len()..].chars().next();
            !(guard_start && before.map_or(false, char::is_alphanumeric))
                && !(guard_end && after.map_or(false, char::is_alphanumeric))
        })
        .map(|(i, m)| (source[i].0, source[i + m.len() - 1].1))
        .collect()
}

fn merge_spans(mut spans: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    spans.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IndexBuilder;
    use crate::transcript::Panel;

    fn doc(date: &str, panels: &[&[&str]]) -> TranscriptDocument {
        TranscriptDocument {
            date: date.into(),
            panels: panels
                .iter()
                .enumerate()
                .map(|(i, lines)| Panel { panel: i as u32 + 1, dialogue: lines.iter().map(|s| s.to_string()).collect() })
                .collect(),
        }
    }

    fn corpus() -> Corpus {
        let docs = vec![
            doc("2001-01-01", &[&["The boss is late"]]),
            doc("2001-01-02", &[&["Budget meeting"], &["The boss cut the budget", "Boss! Budget!"]]),
            doc("2001-01-03", &[&["My budget"], &["boss"]]),
            doc("2001-01-04", &[&["Pointy hair"]]),
        ];
        IndexBuilder::new(Tokenizer::default(), "t").build(&docs).into()
    }

    fn run(query: &str, options: SearchOptions) -> Vec<SearchResult> {
        let corpus = corpus();
        let tokenizer = Tokenizer::default();
        QueryEngine::new(&corpus, &tokenizer, ScoringWeights::default()).search(query, &options)
    }

    fn dates(results: &[SearchResult]) -> Vec<&str> { results.iter().map(|r| r.date.as_str()).collect() }

    #[test]
    fn all_mode_intersects_and_any_mode_unions() {
        let all = run("boss budget", SearchOptions::default());
        assert_eq!(dates(&all), vec!["2001-01-02", "2001-01-03"]);
        let any = run("boss budget", SearchOptions { mode: MatchMode::Any, ..Default::default() });
        assert_eq!(any.len(), 3);
    }

    #[test]
    fn phrase_matches_outrank_scattered_words() {
        let results = run("boss cut", SearchOptions { mode: MatchMode::Any, ..Default::default() });
        assert_eq!(results[0].date, "2001-01-02");
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn ties_break_on_date() {
        let results = run("boss", SearchOptions::default());
        // 2001-01-02 matches on two lines; the others once each.
        let tied: Vec<_> = results.iter().filter(|r| r.date != "2001-01-02").collect();
        assert_eq!(tied[0].score, tied[1].score);
        assert!(tied[0].date < tied[1].date);
    }

    #[test]
    fn highlights_cover_matched_words() {
        let results = run("boss", SearchOptions::default());
        let first = results.iter().find(|r| r.date == "2001-01-01").unwrap();
        assert_eq!(first.matched_panels.len(), 1);
        assert_eq!(first.matched_panels[0].panel, 1);
        assert_eq!(first.matched_panels[0].excerpt.marked("<em>", "</em>"), "The <em>boss</em> is late");
    }

    #[test]
    fn matched_panels_list_every_matching_line() {
        let results = run("budget", SearchOptions::default());
        let doc = results.iter().find(|r| r.date == "2001-01-02").unwrap();
        let at: Vec<(u32, usize)> = doc.matched_panels.iter().map(|m| (m.panel, m.line)).collect();
        assert_eq!(at, vec![(1, 0), (2, 0), (2, 1)]);
    }

    #[test]
    fn date_range_and_paging_apply_after_ranking() {
        let ranged = run(
            "boss",
            SearchOptions { from: Some("2001-01-02".into()), to: Some("2001-01-03".into()), ..Default::default() },
        );
        assert_eq!(dates(&ranged), vec!["2001-01-02", "2001-01-03"]);
        let paged = run("boss", SearchOptions { offset: 1, limit: Some(1), ..Default::default() });
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].date, run("boss", SearchOptions::default())[1].date);
    }

    #[test]
    fn stopword_only_and_blank_queries_are_empty() {
        assert!(run("", SearchOptions::default()).is_empty());
        assert!(run("   \t", SearchOptions::default()).is_empty());
        assert!(run("the", SearchOptions::default()).is_empty());
        assert!(run("boss zeppelin", SearchOptions::default()).is_empty());
    }

    #[test]
    fn overlapping_spans_merge() {
        assert_eq!(merge_spans(vec![(4, 8), (0, 3), (2, 5), (10, 12)]), vec![(0, 8), (10, 12)]);
    }

    #[test]
    fn phrase_must_stand_as_whole_words() {
        assert!(phrase_matches("Education matters", "cat").is_empty());
        assert!(phrase_matches("Vacation time", "cat").is_empty());
        assert_eq!(phrase_matches("A cat!", "cat"), vec![(2, 5)]);
        assert_eq!(phrase_matches("cat-nap", "cat"), vec![(0, 3)]);
        assert_eq!(phrase_matches("Big BOSS here", "boss"), vec![(4, 8)]);
    }

    #[test]
    fn phrase_spans_survive_lowercasing_that_resizes() {
        // U+0130 grows from 2 to 3 bytes when lowercased, U+1E9E shrinks from 3 to 2.
        assert_eq!(phrase_matches("İ boss", "boss"), vec![(3, 7)]);
        assert_eq!(phrase_matches("ẞ boss ẞ", "boss"), vec![(4, 8)]);
        let line = "İİ BOSS K";
        let spans = phrase_matches(line, "boss");
        assert_eq!(spans.len(), 1);
        assert_eq!(&line[spans[0].0..spans[0].1], "BOSS");
    }

    #[test]
    fn words_inside_longer_words_do_not_score() {
        let corpus: Corpus = IndexBuilder::new(Tokenizer::default(), "t")
            .build(&[
                doc("2001-01-01", &[&["The cat sat", "The cat ran"]]),
                doc("2001-01-02", &[&["A cat", "Education matters", "Vacation time"]]),
            ])
            .into();
        let tokenizer = Tokenizer::default();
        let results =
            QueryEngine::new(&corpus, &tokenizer, ScoringWeights::default()).search("cat", &SearchOptions::default());
        assert_eq!(dates(&results), vec!["2001-01-01", "2001-01-02"]);
        assert_eq!(results[0].score, 12.0);
        assert_eq!(results[1].score, 6.0);
        let lines: Vec<String> = results[1].matched_panels.iter().map(|m| m.excerpt.marked("<em>", "</em>")).collect();
        assert_eq!(lines, vec!["A <em>cat</em>"]);
    }
}
