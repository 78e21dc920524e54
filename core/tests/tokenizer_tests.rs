use archive_core::tokenizer::Tokenizer;

#[test]
fn it_normalizes_case_and_width() {
    let words = Tokenizer::default().tokenize("CATBERT Ｃａｔｂｅｒｔ café");
    assert_eq!(words, vec!["catbert", "catbert", "café"]);
}

#[test]
fn it_filters_stopwords_and_short_words() {
    let words = Tokenizer::default().tokenize("The boss and I went to a meeting");
    assert!(!words.contains(&"the".to_string()));
    assert!(!words.contains(&"and".to_string()));
    assert!(!words.contains(&"i".to_string()));
    assert_eq!(words, vec!["boss", "went", "meeting"]);
}

#[test]
fn custom_settings_apply() {
    let tok = Tokenizer::new(4, ["boss"]);
    assert_eq!(tok.tokenize("The pointy-haired boss hates Wally"), vec!["pointy", "haired", "hates", "wally"]);
}
