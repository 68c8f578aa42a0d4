//! Recall search over stored records.
//!
//! Vector search does the heavy lifting; when it returns fewer than
//! [`MIN_VECTOR_RESULTS`] matches the result is augmented with a token
//! overlap pass over titles, bodies and keyword lists, so short or
//! out-of-vocabulary queries still recall something. Augmented matches carry
//! a synthetic similarity strictly below any plausible vector score band, so
//! real hits keep outranking them.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::records::Record;
use crate::semantic::features::{tokenize, FeatureGenerator};
use crate::semantic::index::{IndexError, VectorIndex};

/// Vector result count below which the keyword fallback kicks in.
pub const MIN_VECTOR_RESULTS: usize = 3;

/// Synthetic similarity band for fallback matches: [0.2, 0.3).
const FALLBACK_BASE: f32 = 0.2;
const FALLBACK_SPAN: f32 = 0.1;

/// Why a record matched, strongest signal first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    TitleMatch,
    ContentMatch,
    KeywordOverlap,
    SemanticSimilarity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub record_id: u64,
    pub similarity: f32,
    pub shared_keywords: Vec<String>,
    pub match_reason: MatchReason,
}

/// Search `records` for the query, at most `limit` results with vector
/// similarity at or above `threshold`.
pub fn search(
    records: &[Record],
    index: &dyn VectorIndex,
    generator: &FeatureGenerator,
    query: &str,
    limit: usize,
    threshold: f32,
) -> Result<Vec<Match>, IndexError> {
    let by_id: HashMap<u64, &Record> = records.iter().map(|r| (r.id, r)).collect();
    let query_tokens = tokenize(query);

    let query_vector = generator.generate(query, "", &[]);
    let hits = index.search(&query_vector, limit, threshold)?;

    let mut matches: Vec<Match> = hits
        .into_iter()
        .filter_map(|(record_id, similarity)| {
            // the index can briefly hold ids whose record is already gone
            let record = by_id.get(&record_id)?;
            let shared = shared_keywords(&query_tokens, record);
            let reason = match_reason(query, record, &shared);
            Some(Match {
                record_id,
                similarity,
                shared_keywords: shared,
                match_reason: reason,
            })
        })
        .collect();

    if matches.len() < MIN_VECTOR_RESULTS {
        augment_with_keywords(&mut matches, records, &query_tokens, query);
    }

    matches.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(limit);

    Ok(matches)
}

/// How many query tokens occur anywhere in the record's title, body or
/// keyword list.
fn token_overlap(query_tokens: &[String], record: &Record) -> usize {
    let mut haystack: HashSet<String> = tokenize(&record.title).into_iter().collect();
    haystack.extend(tokenize(&record.body));
    haystack.extend(record.keywords.iter().cloned());

    query_tokens
        .iter()
        .filter(|token| haystack.contains(token.as_str()))
        .count()
}

/// Query tokens that appear among the record's keywords, in record order.
fn shared_keywords(query_tokens: &[String], record: &Record) -> Vec<String> {
    record
        .keywords
        .iter()
        .filter(|keyword| query_tokens.iter().any(|token| token == *keyword))
        .cloned()
        .collect()
}

fn match_reason(query: &str, record: &Record, shared: &[String]) -> MatchReason {
    let needle = query.trim().to_lowercase();
    if !needle.is_empty() {
        if record.title.to_lowercase().contains(&needle) {
            return MatchReason::TitleMatch;
        }
        if record.body.to_lowercase().contains(&needle) {
            return MatchReason::ContentMatch;
        }
    }
    if !shared.is_empty() {
        return MatchReason::KeywordOverlap;
    }
    MatchReason::SemanticSimilarity
}

fn augment_with_keywords(
    matches: &mut Vec<Match>,
    records: &[Record],
    query_tokens: &[String],
    query: &str,
) {
    if query_tokens.is_empty() {
        return;
    }

    let mut scored: Vec<(&Record, usize)> = records
        .iter()
        .filter(|record| matches.iter().all(|m| m.record_id != record.id))
        .filter_map(|record| {
            let overlap = token_overlap(query_tokens, record);
            (overlap > 0).then_some((record, overlap))
        })
        .collect();

    let Some(max_overlap) = scored.iter().map(|(_, s)| *s).max() else {
        return;
    };

    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.id.cmp(&b.0.id)));

    for (record, overlap) in scored {
        let similarity = FALLBACK_BASE + FALLBACK_SPAN * overlap as f32 / (max_overlap as f32 + 1.0);
        let shared = shared_keywords(query_tokens, record);
        let reason = match_reason(query, record, &shared);
        matches.push(Match {
            record_id: record.id,
            similarity,
            shared_keywords: shared,
            match_reason: reason,
        });
    }
}
