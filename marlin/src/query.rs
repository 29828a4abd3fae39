//! Query text to terms, plus the request and response shapes.
//!
//! Terms by word count:
//!
//! * one word: the word
//! * two words: both words and their concatenation
//! * more: every word, every adjacent concatenation and the concatenation
//!   of all words, e.g. "a new hope" gives `a anew new newhope hope anewhope`
//!
//! Prefix matching applies to the last word and to concatenations ending
//! with it. Concatenations never allow typos.

use serde_json::{Map, Value};

use crate::analyzer::Analyzer;
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermKind {
    /// A single query word, by index.
    Word(usize),
    /// Words `i` and `i + 1` joined.
    Bigram(usize),
    /// All words joined.
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Term {
    pub word: Vec<char>,
    pub kind: TermKind,
    pub prefix: bool,
    pub typos: bool,
}

impl Term {
    pub fn text(&self) -> String {
        self.word.iter().collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub words: Vec<Vec<char>>,
    pub terms: Vec<Term>,
}

impl Query {
    pub fn parse(text: &str, analyzer: &dyn Analyzer, prefix: bool, typos: bool) -> Query {
        let mut words: Vec<Vec<char>> = Vec::new();
        analyzer.analyze_for_search(text, &mut |word, _| words.push(word.to_vec()));
        let n = words.len();
        let joined = |from: usize, to: usize| -> Vec<char> { words[from..=to].concat() };
        let mut terms = Vec::with_capacity(n * 2);
        for i in 0..n {
            terms.push(Term {
                word: words[i].clone(),
                kind: TermKind::Word(i),
                prefix: prefix && i + 1 == n,
                typos,
            });
            if n > 2 && i + 1 < n {
                terms.push(Term {
                    word: joined(i, i + 1),
                    kind: TermKind::Bigram(i),
                    prefix: prefix && i + 2 == n,
                    typos: false,
                });
            }
        }
        if n > 1 {
            terms.push(Term {
                word: joined(0, n - 1),
                kind: TermKind::Full,
                prefix,
                typos: false,
            });
        }
        Query {
            text: text.to_string(),
            words,
            terms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// For every word, the terms that can stand in for it: the word itself
    /// and the bigrams it is part of.
    pub fn groups(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.words.len()];
        for (t, term) in self.terms.iter().enumerate() {
            match term.kind {
                TermKind::Word(i) => groups[i].push(t),
                TermKind::Bigram(i) => {
                    groups[i].push(t);
                    groups[i + 1].push(t);
                }
                TermKind::Full => {}
            }
        }
        groups
    }

    pub fn full_term(&self) -> Option<usize> {
        self.terms.iter().position(|t| t.kind == TermKind::Full)
    }
}

/// A search request. Unset limits fall back to the index settings.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct QueryRequest {
    pub q: String,
    pub filter: Option<Value>,
    pub aggs: Option<Value>,
    /// 1-based.
    pub page: usize,
    pub hits_per_page: Option<usize>,
    pub max_hits: Option<usize>,
    pub max_facet_results: Option<usize>,
    pub full_scan: bool,
    pub rules: Option<Vec<String>>,
    pub facets: Option<Vec<String>>,
    pub explain: bool,
}

impl Default for QueryRequest {
    fn default() -> QueryRequest {
        QueryRequest {
            q: String::new(),
            filter: None,
            aggs: None,
            page: 1,
            hits_per_page: None,
            max_hits: None,
            max_facet_results: None,
            full_scan: false,
            rules: None,
            facets: None,
            explain: false,
        }
    }
}

impl QueryRequest {
    pub fn new(q: &str) -> QueryRequest {
        QueryRequest {
            q: q.to_string(),
            ..QueryRequest::default()
        }
    }

    pub fn from_json(json: &Value) -> Result<QueryRequest, Error> {
        let req: QueryRequest =
            serde_json::from_value(json.clone()).map_err(|e| Error::invalid(format!("Invalid query: {}", e)))?;
        req.validate()?;
        Ok(req)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.page == 0 {
            return Err(Error::invalid("page starts at 1"));
        }
        if self.hits_per_page == Some(0) || self.max_hits == Some(0) {
            return Err(Error::invalid("hitsPerPage and maxHits must be positive"));
        }
        Ok(())
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct FacetCount {
    pub value: String,
    pub count: u64,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub total_hits: u64,
    pub num_hits: usize,
    pub page: usize,
    pub num_pages: usize,
    pub hits: Vec<Value>,
    pub facets: Map<String, Value>,
    pub aggs: Map<String, Value>,
    /// Milliseconds.
    pub took: u64,
    pub full_scan: bool,
}

pub fn num_pages(total_hits: u64, max_hits: usize, hits_per_page: usize) -> usize {
    let visible = (total_hits as usize).min(max_hits);
    (visible + hits_per_page - 1) / hits_per_page
}
