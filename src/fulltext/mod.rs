//! Inverted index over selected item attributes with ranked, time-bounded search.

mod index;
mod search;
mod tokenizer;

use serde::{Deserialize, Serialize};

pub use index::FullTextIndex;
pub use search::{search, SearchHit, SearchResult};
pub use tokenizer::{Tokenizer, ENGLISH_STOPWORDS};

/// Name of the lock ladder guarding the full-text index.
pub const FULLTEXT_RESOURCE: &str = "$fulltext";

/// Tokenization and ranking parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullTextOptions {
    /// BM25 term-frequency saturation.
    pub k1: f64,
    /// BM25 document-length normalization.
    pub b: f64,
    /// Score multiplier for prefix (non-identical) term matches.
    pub prefix_weight: f64,
    /// Tokens shorter than this many characters are dropped.
    pub min_token_len: usize,
    /// Upper bound on indexed terms one query token may expand to.
    pub max_prefix_expansions: usize,
    /// Terms never indexed or searched.
    pub stopwords: Vec<String>,
}

impl Default for FullTextOptions {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            prefix_weight: 0.5,
            min_token_len: 1,
            max_prefix_expansions: 64,
            stopwords: Vec::new(),
        }
    }
}

impl FullTextOptions {
    /// Enables the built-in English stopword list.
    pub fn with_english_stopwords(mut self) -> Self {
        self.stopwords = ENGLISH_STOPWORDS.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    /// Builds the tokenizer these options describe.
    pub fn tokenizer(&self) -> Tokenizer {
        Tokenizer::new(self.min_token_len, &self.stopwords)
    }
}
