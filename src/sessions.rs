//! Capture sessions and the operations between them.
//!
//! A session is identified by the `session_id` records carry; the functions
//! here work on the member records of two sessions. Membership is keyed by
//! URL, with the latest timestamp per URL treated as that URL's state.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::records::Record;
use crate::storage::{StorageManager, StoreError};

pub const SESSIONS_FILE: &str = "sessions.json";

/// Component weights of the session similarity score.
const URL_WEIGHT: f32 = 0.5;
const KEYWORD_WEIGHT: f32 = 0.3;
const DOMAIN_WEIGHT: f32 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Session {
    /// Combine two session rows. The earlier-starting session's id survives;
    /// the merged session stays open if either input was.
    pub fn merged(&self, other: &Session, keywords: Vec<String>) -> Session {
        let id = if self.start_time_ms <= other.start_time_ms {
            self.id.clone()
        } else {
            other.id.clone()
        };
        let end_time_ms = match (self.end_time_ms, other.end_time_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        Session {
            id,
            start_time_ms: self.start_time_ms.min(other.start_time_ms),
            end_time_ms,
            keywords,
        }
    }
}

/// URL-level difference between two sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

/// Latest timestamp per URL across a member list.
fn url_states(records: &[Record]) -> HashMap<&str, u64> {
    let mut states: HashMap<&str, u64> = HashMap::new();
    for record in records {
        let entry = states.entry(record.url.as_str()).or_insert(0);
        *entry = (*entry).max(record.timestamp_ms);
    }
    states
}

/// What changed going from session `a` to session `b`.
pub fn diff(a: &[Record], b: &[Record]) -> SessionDiff {
    let before = url_states(a);
    let after = url_states(b);

    let mut added: Vec<String> = after
        .keys()
        .filter(|url| !before.contains_key(**url))
        .map(|url| url.to_string())
        .collect();
    let mut removed: Vec<String> = before
        .keys()
        .filter(|url| !after.contains_key(**url))
        .map(|url| url.to_string())
        .collect();
    let mut modified: Vec<String> = before
        .iter()
        .filter(|(url, ts)| after.get(**url).is_some_and(|other| other != *ts))
        .map(|(url, _)| url.to_string())
        .collect();

    added.sort();
    removed.sort();
    modified.sort();

    SessionDiff {
        added,
        removed,
        modified,
    }
}

fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

/// Weighted overlap of two sessions in [0, 1].
///
/// Two empty sessions are identical; an empty session shares nothing with a
/// non-empty one.
pub fn similarity(a: &[Record], b: &[Record]) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let urls_a: HashSet<&str> = a.iter().map(|r| r.url.as_str()).collect();
    let urls_b: HashSet<&str> = b.iter().map(|r| r.url.as_str()).collect();

    let keywords_a: HashSet<&str> = a
        .iter()
        .flat_map(|r| r.keywords.iter().map(String::as_str))
        .collect();
    let keywords_b: HashSet<&str> = b
        .iter()
        .flat_map(|r| r.keywords.iter().map(String::as_str))
        .collect();

    let domains_a: HashSet<&str> = a.iter().map(|r| r.domain.as_str()).collect();
    let domains_b: HashSet<&str> = b.iter().map(|r| r.domain.as_str()).collect();

    URL_WEIGHT * jaccard(&urls_a, &urls_b)
        + KEYWORD_WEIGHT * jaccard(&keywords_a, &keywords_b)
        + DOMAIN_WEIGHT * jaccard(&domains_a, &domains_b)
}

/// Union of two member lists by URL, keeping the later capture per URL.
///
/// Returns the surviving records (newest first) and the ids displaced by the
/// merge, so the caller can cascade their removal.
pub fn merge_members(a: &[Record], b: &[Record]) -> (Vec<Record>, Vec<u64>) {
    let mut by_url: HashMap<&str, &Record> = HashMap::new();
    for record in a.iter().chain(b.iter()) {
        match by_url.get(record.url.as_str()) {
            Some(existing) if existing.timestamp_ms >= record.timestamp_ms => {}
            _ => {
                by_url.insert(record.url.as_str(), record);
            }
        }
    }

    let winner_ids: HashSet<u64> = by_url.values().map(|r| r.id).collect();
    let losers: Vec<u64> = a
        .iter()
        .chain(b.iter())
        .filter(|r| !winner_ids.contains(&r.id))
        .map(|r| r.id)
        .collect();

    let mut winners: Vec<Record> = by_url.into_values().cloned().collect();
    winners.sort_by(|x, y| y.timestamp_ms.cmp(&x.timestamp_ms).then(x.id.cmp(&y.id)));

    (winners, losers)
}

/// Keywords present in at least two of the merged sessions, most common
/// first, ties alphabetical.
pub fn merged_keywords(member_lists: &[&[Record]]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for members in member_lists {
        let session_set: BTreeSet<&str> = members
            .iter()
            .flat_map(|r| r.keywords.iter().map(String::as_str))
            .collect();
        for keyword in session_set {
            *counts.entry(keyword.to_string()).or_insert(0) += 1;
        }
    }

    let mut shared: Vec<(String, usize)> =
        counts.into_iter().filter(|(_, n)| *n >= 2).collect();
    shared.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    shared.into_iter().map(|(keyword, _)| keyword).collect()
}

pub fn load_sessions(storage: &dyn StorageManager) -> Result<Vec<Session>, StoreError> {
    if !storage.exists(SESSIONS_FILE) {
        return Ok(vec![]);
    }
    let raw = storage.read(SESSIONS_FILE)?;
    serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt {
        name: SESSIONS_FILE.to_string(),
        reason: err.to_string(),
    })
}

pub fn save_sessions(
    storage: &dyn StorageManager,
    sessions: &[Session],
) -> Result<(), StoreError> {
    let raw = serde_json::to_vec_pretty(sessions).map_err(|err| StoreError::Corrupt {
        name: SESSIONS_FILE.to_string(),
        reason: err.to_string(),
    })?;
    storage.write(SESSIONS_FILE, &raw)
}
