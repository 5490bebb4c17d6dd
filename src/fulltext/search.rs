use std::cmp::Ordering;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::types::ItemId;

use super::index::FullTextIndex;
use super::tokenizer::Tokenizer;
use super::FullTextOptions;

/// Postings scored between two deadline checks.
const DEADLINE_CHECK_INTERVAL: usize = 256;

/// One ranked search hit.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    /// Matching item.
    pub item: ItemId,
    /// Relevance; higher is better.
    pub score: f64,
}

/// Result of [`search`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchResult {
    /// At most `max_results` hits, best first; ties by ascending item id.
    pub hits: Vec<SearchHit>,
    /// Number of matching items. Exact unless `timed_out`, then a lower bound.
    pub estimation: usize,
    /// Whether the time budget ran out before every posting was scored.
    pub timed_out: bool,
}

#[derive(Debug)]
struct ExpandedTerm<'a> {
    term: &'a str,
    weight: f64,
    df: usize,
}

/// Ranks indexed items against `query` with BM25.
///
/// Each query token matches the identical indexed term at full weight and any
/// longer term it prefixes at `prefix_weight`. Scores sum across tokens, so an
/// item needs to match only one of them. Rare terms are scored first, which
/// keeps the partial ranking useful when the deadline cuts evaluation short.
pub fn search(
    index: &FullTextIndex,
    tokenizer: &Tokenizer,
    options: &FullTextOptions,
    query: &str,
    max_results: usize,
    max_time: Duration,
) -> SearchResult {
    let started = Instant::now();
    let deadline = started + max_time;
    let mut terms = expand_query(index, tokenizer, options, query);
    terms.sort_by(|a, b| a.df.cmp(&b.df).then_with(|| a.term.cmp(b.term)));

    let n = index.doc_count() as f64;
    let avgdl = index.avg_doc_len().max(1.0);
    let (k1, b) = (options.k1, options.b);
    let mut scores: FxHashMap<ItemId, f64> = FxHashMap::default();
    let mut scored = 0usize;
    let mut timed_out = false;

    'terms: for expanded in &terms {
        let Some(postings) = index.postings(expanded.term) else {
            continue;
        };
        let df = expanded.df as f64;
        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
        for (item, tf) in postings {
            if scored % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                timed_out = true;
                break 'terms;
            }
            scored += 1;
            let tf = f64::from(*tf);
            let len = f64::from(index.doc_len(*item));
            let norm = tf * (k1 + 1.0) / (tf + k1 * (1.0 - b + b * len / avgdl));
            *scores.entry(*item).or_insert(0.0) += expanded.weight * idf * norm;
        }
    }

    let estimation = if timed_out {
        let largest_df = terms.iter().map(|t| t.df).max().unwrap_or(0);
        scores.len().max(largest_df)
    } else {
        scores.len()
    };
    let mut hits: Vec<SearchHit> = scores
        .into_iter()
        .map(|(item, score)| SearchHit { item, score })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.item.cmp(&b.item))
    });
    hits.truncate(max_results);
    debug!(
        terms = terms.len(),
        scored,
        estimation,
        timed_out,
        elapsed_us = started.elapsed().as_micros() as u64,
        "fulltext.search.done"
    );
    SearchResult {
        hits,
        estimation,
        timed_out,
    }
}

fn expand_query<'a>(
    index: &'a FullTextIndex,
    tokenizer: &Tokenizer,
    options: &FullTextOptions,
    query: &str,
) -> Vec<ExpandedTerm<'a>> {
    let mut weights: FxHashMap<&'a str, f64> = FxHashMap::default();
    for token in tokenizer.tokenize_unique(query) {
        for term in index.terms_with_prefix(&token, options.max_prefix_expansions.max(1)) {
            let weight = if term == token {
                1.0
            } else {
                options.prefix_weight
            };
            let slot = weights.entry(term).or_insert(weight);
            if weight > *slot {
                *slot = weight;
            }
        }
    }
    weights
        .into_iter()
        .map(|(term, weight)| ExpandedTerm {
            term,
            weight,
            df: index.doc_freq(term),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(docs: &[(u64, &str)], tokenizer: &Tokenizer) -> FullTextIndex {
        let mut index = FullTextIndex::new();
        for (id, text) in docs {
            index.index_document(ItemId(*id), &tokenizer.tokenize(text));
        }
        index
    }

    #[test]
    fn prefix_query_finds_longer_term() {
        let tokenizer = Tokenizer::default();
        let index = index_of(&[(1, "ABCDEFGH"), (2, "unrelated")], &tokenizer);
        let result = search(
            &index,
            &tokenizer,
            &FullTextOptions::default(),
            "ABCD",
            10,
            Duration::from_secs(1),
        );
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].item, ItemId(1));
        assert!(result.estimation >= 1);
        assert!(!result.timed_out);
    }

    #[test]
    fn exact_and_frequent_matches_rank_higher() {
        let tokenizer = Tokenizer::default();
        let index = index_of(
            &[
                (1, "flu"),
                (2, "flu flu fever"),
                (3, "fluid intake"),
                (4, "fracture"),
            ],
            &tokenizer,
        );
        let result = search(
            &index,
            &tokenizer,
            &FullTextOptions::default(),
            "flu",
            10,
            Duration::from_secs(1),
        );
        let order: Vec<ItemId> = result.hits.iter().map(|h| h.item).collect();
        assert_eq!(order.len(), 3);
        assert_eq!(*order.last().unwrap_or(&ItemId(0)), ItemId(3));
        assert_eq!(result.estimation, 3);
        assert!(result.hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn max_results_truncates_but_estimation_counts_all() {
        let tokenizer = Tokenizer::default();
        let docs: Vec<(u64, String)> = (1..=20).map(|i| (i, format!("note {i}"))).collect();
        let borrowed: Vec<(u64, &str)> = docs.iter().map(|(i, s)| (*i, s.as_str())).collect();
        let index = index_of(&borrowed, &tokenizer);
        let result = search(
            &index,
            &tokenizer,
            &FullTextOptions::default(),
            "note",
            5,
            Duration::from_secs(1),
        );
        assert_eq!(result.hits.len(), 5);
        assert_eq!(result.estimation, 20);
        // Equal scores fall back to ascending ids.
        assert_eq!(result.hits[0].item, ItemId(1));
    }

    #[test]
    fn expired_budget_reports_lower_bound() {
        let tokenizer = Tokenizer::default();
        let docs: Vec<(u64, String)> = (1..=50).map(|i| (i, "common".to_string())).collect();
        let borrowed: Vec<(u64, &str)> = docs.iter().map(|(i, s)| (*i, s.as_str())).collect();
        let index = index_of(&borrowed, &tokenizer);
        let result = search(
            &index,
            &tokenizer,
            &FullTextOptions::default(),
            "common",
            10,
            Duration::ZERO,
        );
        assert!(result.timed_out);
        assert!(result.hits.len() <= result.estimation);
        assert_eq!(result.estimation, 50);
    }
}
