use std::collections::BTreeMap;
use std::ops::Bound;

use rustc_hash::FxHashMap;

use crate::types::ItemId;

#[derive(Debug, Clone)]
struct DocEntry {
    len: u32,
    terms: Vec<String>,
}

/// Inverted index: term -> item -> term frequency.
///
/// Terms are kept sorted so prefix expansion is a range scan.
#[derive(Debug, Default)]
pub struct FullTextIndex {
    postings: BTreeMap<String, BTreeMap<ItemId, u32>>,
    docs: FxHashMap<ItemId, DocEntry>,
    total_len: u64,
}

impl FullTextIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the document of `item` with `tokens`.
    pub fn index_document(&mut self, item: ItemId, tokens: &[String]) {
        self.remove_document(item);
        if tokens.is_empty() {
            return;
        }
        let mut freqs: BTreeMap<&str, u32> = BTreeMap::new();
        for token in tokens {
            *freqs.entry(token.as_str()).or_insert(0) += 1;
        }
        let mut terms = Vec::with_capacity(freqs.len());
        for (term, tf) in freqs {
            self.postings
                .entry(term.to_owned())
                .or_default()
                .insert(item, tf);
            terms.push(term.to_owned());
        }
        let len = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
        self.total_len += u64::from(len);
        self.docs.insert(item, DocEntry { len, terms });
    }

    /// Drops every posting of `item`. Returns whether it was indexed.
    pub fn remove_document(&mut self, item: ItemId) -> bool {
        let Some(doc) = self.docs.remove(&item) else {
            return false;
        };
        self.total_len -= u64::from(doc.len);
        for term in doc.terms {
            if let Some(items) = self.postings.get_mut(&term) {
                items.remove(&item);
                if items.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        true
    }

    /// Whether `item` has a document.
    pub fn contains(&self, item: ItemId) -> bool {
        self.docs.contains_key(&item)
    }

    /// Number of indexed documents.
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    /// Number of distinct terms.
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// Token count of `item`'s document; 0 when absent.
    pub fn doc_len(&self, item: ItemId) -> u32 {
        self.docs.get(&item).map_or(0, |d| d.len)
    }

    /// Mean document length in tokens, 0 for an empty index.
    pub fn avg_doc_len(&self) -> f64 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_len as f64 / self.docs.len() as f64
        }
    }

    /// Documents containing `term`.
    pub fn doc_freq(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, BTreeMap::len)
    }

    /// Term frequency per document for `term`.
    pub fn postings(&self, term: &str) -> Option<&BTreeMap<ItemId, u32>> {
        self.postings.get(term)
    }

    /// Indexed terms starting with `prefix` (the exact term included), sorted,
    /// at most `limit` of them.
    pub fn terms_with_prefix(&self, prefix: &str, limit: usize) -> Vec<&str> {
        self.postings
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(term, _)| term.as_str())
            .take_while(|term| term.starts_with(prefix))
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn reindexing_replaces_postings() {
        let mut index = FullTextIndex::new();
        index.index_document(ItemId(1), &tokens(&["flu", "fever", "flu"]));
        assert_eq!(index.postings("flu").and_then(|p| p.get(&ItemId(1))), Some(&2));
        assert_eq!(index.doc_len(ItemId(1)), 3);

        index.index_document(ItemId(1), &tokens(&["cough"]));
        assert!(index.postings("flu").is_none());
        assert_eq!(index.doc_freq("cough"), 1);
        assert_eq!(index.avg_doc_len(), 1.0);

        assert!(index.remove_document(ItemId(1)));
        assert_eq!(index.term_count(), 0);
        assert_eq!(index.doc_count(), 0);
        assert!(!index.remove_document(ItemId(1)));
    }

    #[test]
    fn prefix_expansion_is_bounded() {
        let mut index = FullTextIndex::new();
        index.index_document(ItemId(1), &tokens(&["abc", "abcd", "abcdefgh", "abd", "b"]));
        assert_eq!(index.terms_with_prefix("abc", 10), vec!["abc", "abcd", "abcdefgh"]);
        assert_eq!(index.terms_with_prefix("abc", 2), vec!["abc", "abcd"]);
        assert!(index.terms_with_prefix("zz", 10).is_empty());
    }
}
