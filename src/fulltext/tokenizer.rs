//! Text to terms: UAX#29 word boundaries, lowercase, length and stopword filters.

use rustc_hash::FxHashSet;
use unicode_segmentation::UnicodeSegmentation;

/// English stopwords (Lucene's default set), available for
/// [`super::FullTextOptions::stopwords`].
pub const ENGLISH_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// Configured tokenizer shared by indexing and querying.
#[derive(Clone, Debug)]
pub struct Tokenizer {
    min_len: usize,
    stopwords: FxHashSet<String>,
}

impl Tokenizer {
    /// Drops terms shorter than `min_len` characters and any listed stopword, case-insensitively.
    pub fn new(min_len: usize, stopwords: &[String]) -> Self {
        Self {
            min_len: min_len.max(1),
            stopwords: stopwords.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// Splits `text` into lowercase terms, in order, duplicates kept.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.unicode_words()
            .map(|w| {
                w.chars()
                    .filter(|c| c.is_alphanumeric())
                    .flat_map(char::to_lowercase)
                    .collect::<String>()
            })
            .filter(|w| w.chars().count() >= self.min_len)
            .filter(|w| !self.stopwords.contains(w))
            .collect()
    }

    /// Query form: terms deduplicated, first occurrence kept.
    pub fn tokenize_unique(&self, text: &str) -> Vec<String> {
        let mut seen = FxHashSet::default();
        self.tokenize(text)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(1, &[])
    }
}
