use std::collections::HashMap;
use std::fmt::Debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::Error;

/// Longest token the default analyzer keeps before starting over.
const MAX_TOKEN_LEN: usize = 127;
const MAX_WHITESPACE_TOKEN_LEN: usize = 255;

/// Receives each token with its position in the analyzed text.
pub type Emit<'e> = dyn FnMut(&[char], u32) + 'e;

pub trait Analyzer: AnalyzerClone + Send + Sync + Debug {
    fn analyzer_type(&self) -> &'static str;

    fn analyze_for_indexing(&self, value: &str, emit: &mut Emit);

    fn analyze_for_search(&self, value: &str, emit: &mut Emit) {
        self.analyze_for_indexing(value, emit)
    }
}

pub trait AnalyzerClone {
    fn clone_box(&self) -> Box<dyn Analyzer>;
}

impl<T> AnalyzerClone for T
where
    T: 'static + Analyzer + Clone,
{
    fn clone_box(&self) -> Box<dyn Analyzer> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn Analyzer> {
    fn clone(&self) -> Box<dyn Analyzer> {
        self.clone_box()
    }
}

/// Collects the tokens of `value` as owned words, mostly for queries.
pub fn tokens(analyzer: &dyn Analyzer, value: &str) -> Vec<(Vec<char>, u32)> {
    let mut out = Vec::new();
    analyzer.analyze_for_search(value, &mut |word, pos| out.push((word.to_vec(), pos)));
    out
}

/// Named analyzers available to an index.
#[derive(Clone, Debug)]
pub struct AnalyzerRegistry {
    analyzers: HashMap<&'static str, Box<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> AnalyzerRegistry {
        let mut registry = AnalyzerRegistry {
            analyzers: HashMap::new(),
        };
        registry.register(Box::new(DefaultAnalyzer));
        registry.register(Box::new(WhiteSpaceAnalyzer));
        registry.register(Box::new(UAX29Analyzer));
        registry
    }

    pub fn register(&mut self, analyzer: Box<dyn Analyzer>) {
        self.analyzers.insert(analyzer.analyzer_type(), analyzer);
    }

    pub fn get(&self, name: &str) -> Result<Box<dyn Analyzer>, Error> {
        self.analyzers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("No such analyzer {}", name)))
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> AnalyzerRegistry {
        AnalyzerRegistry::new()
    }
}

/// Case folds and strips accents, then splits on anything that is not a
/// letter, digit or underscore. Abbreviations ("u.s.a") and apostrophes
/// ("don't") are glued together. A hyphenated word yields its parts and
/// the joined word, the latter sharing the position of the first part.
#[derive(Clone, Debug, Default)]
pub struct DefaultAnalyzer;

fn fold(value: &str) -> impl Iterator<Item = char> + '_ {
    value
        .nfkd()
        .filter(|c| !is_combining_mark(*c) && !c.is_control())
        .flat_map(char::to_lowercase)
}

impl Analyzer for DefaultAnalyzer {
    fn analyzer_type(&self) -> &'static str {
        "default"
    }

    fn analyze_for_indexing(&self, value: &str, emit: &mut Emit) {
        let mut token: Vec<char> = Vec::with_capacity(MAX_TOKEN_LEN + 1);
        let mut position: u32 = 0;
        let mut abbrev = false;
        let mut hyphen = false;
        let mut hs = 0;
        let mut chars = fold(value).peekable();
        while let Some(c) = chars.next() {
            let mut end = chars.peek().is_none();
            if c.is_alphanumeric() || c == '_' {
                token.push(c);
            } else if c == '.' && (token.len() == 1 || abbrev) {
                abbrev = true;
            } else if c == '\'' {
                abbrev = true;
            } else if c == '-' && !token.is_empty() {
                hyphen = true;
                emit(&token[hs..], position);
                position += 1;
                hs = token.len();
            } else {
                end = true;
            }
            if end && !token.is_empty() {
                let mut joined = true;
                if hyphen {
                    if token.len() > hs {
                        emit(&token[hs..], position);
                        position = position.saturating_sub(1);
                    } else {
                        joined = false;
                    }
                }
                if joined {
                    emit(&token, position);
                    position += 1;
                }
                hyphen = false;
                abbrev = false;
                hs = 0;
                token.clear();
            }
            if token.len() >= MAX_TOKEN_LEN {
                token.clear();
                hs = 0;
            }
        }
    }
}

/// Splits on spaces only and keeps the text as is.
#[derive(Clone, Debug, Default)]
pub struct WhiteSpaceAnalyzer;

impl Analyzer for WhiteSpaceAnalyzer {
    fn analyzer_type(&self) -> &'static str {
        "whitespace"
    }

    fn analyze_for_indexing(&self, value: &str, emit: &mut Emit) {
        let mut position = 0;
        for word in value.split(' ').filter(|w| !w.is_empty()) {
            let chars: Vec<char> = word.chars().collect();
            for chunk in chars.chunks(MAX_WHITESPACE_TOKEN_LEN) {
                emit(chunk, position);
                position += 1;
            }
        }
    }
}

/// Unicode word boundaries with lower casing.
#[derive(Clone, Debug, Default)]
pub struct UAX29Analyzer;

impl Analyzer for UAX29Analyzer {
    fn analyzer_type(&self) -> &'static str {
        "uax29"
    }

    fn analyze_for_indexing(&self, value: &str, emit: &mut Emit) {
        let mut position = 0;
        for token in value
            .unicode_words()
            .filter(|token| !is_only_whitespace_or_control_char(token))
        {
            let chars: Vec<char> = token.chars().flat_map(char::to_lowercase).collect();
            emit(&chars, position);
            position += 1;
        }
    }
}

fn is_only_whitespace_or_control_char(s: &str) -> bool {
    s.chars().all(|c| c.is_whitespace() || c.is_control())
}
