use archive_core::search::QueryEngine;
use archive_core::tokenizer::Tokenizer;
use archive_core::{Corpus, IndexBuilder, Panel, ScoringWeights, SearchOptions, TranscriptDocument};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const WORDS: &[&str] = &[
    "boss", "budget", "meeting", "engineer", "deadline", "cubicle", "memo", "project", "consultant",
    "coffee", "server", "upgrade", "strategy", "synergy", "quarterly", "report", "intern", "raise",
];

fn synthetic_archive(strips: usize) -> Vec<TranscriptDocument> {
    (0..strips)
        .map(|i| {
            let day = time::Date::from_ordinal_date(1990, 1).unwrap() + time::Duration::days(i as i64);
            let panels = (0..3u32)
                .map(|p| {
                    let line: Vec<&str> = (0..8).map(|w| WORDS[(i * 7 + p as usize * 3 + w) % WORDS.len()]).collect();
                    Panel { panel: p + 1, dialogue: vec![format!("The {}!", line.join(" "))] }
                })
                .collect();
            TranscriptDocument { date: day.to_string(), panels }
        })
        .collect()
}

fn bench_tokenize(c: &mut Criterion) {
    let tokenizer = Tokenizer::default();
    let text = "Ｂｏｓｓ, the quarterly REPORT is late again. Catbert says it's the budget's fault!";
    c.bench_function("tokenize_line", |b| b.iter(|| tokenizer.tokenize(black_box(text))));
}

fn bench_build_and_search(c: &mut Criterion) {
    let docs = synthetic_archive(5_000);
    let builder = IndexBuilder::new(Tokenizer::default(), "bench");
    c.bench_function("build_5000_strips", |b| b.iter(|| builder.build(black_box(&docs))));

    let corpus: Corpus = builder.build(&docs).into();
    let tokenizer = Tokenizer::default();
    let engine = QueryEngine::new(&corpus, &tokenizer, ScoringWeights::default());
    let options = SearchOptions { limit: Some(20), ..SearchOptions::default() };
    c.bench_function("search_two_words", |b| b.iter(|| engine.search(black_box("budget meeting"), &options)));
}

criterion_group!(benches, bench_tokenize, bench_build_and_search);
criterion_main!(benches);
