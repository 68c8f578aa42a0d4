//! Privacy rules applied at capture time.
//!
//! A rule names something that must not be captured: a domain, a keyword or
//! a date range. Rules are consulted before a record is stored; toggling a
//! rule changes future captures only, never what is already stored.
//!
//! Domain and keyword values use the `r/.../` convention for regex patterns,
//! anything else is a case-insensitive substring match.

use anyhow::{bail, Context};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::eid::Eid;
use crate::records::{now_ms, Record};
use crate::storage::{StorageManager, StoreError};

pub const RULES_FILE: &str = "rules.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Domain,
    Date,
    Keyword,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Inactive,
}

impl RuleStatus {
    pub fn flipped(self) -> RuleStatus {
        match self {
            RuleStatus::Active => RuleStatus::Inactive,
            RuleStatus::Inactive => RuleStatus::Active,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyRule {
    pub id: Eid,
    pub kind: RuleKind,
    pub value: String,
    pub status: RuleStatus,
    pub created_at_ms: u64,
}

impl PrivacyRule {
    pub fn new(kind: RuleKind, value: String) -> Self {
        Self {
            id: Eid::new(),
            kind,
            value,
            status: RuleStatus::Active,
            created_at_ms: now_ms(),
        }
    }

    /// Checked before a rule is accepted, so stored rules always match
    /// cleanly later.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.value.trim().is_empty() {
            bail!("rule value must not be empty");
        }
        match self.kind {
            RuleKind::Domain | RuleKind::Keyword => {
                if let Some(pattern) = regex_pattern(&self.value) {
                    Regex::new(pattern)
                        .with_context(|| format!("malformed rule pattern: {}", self.value))?;
                }
            }
            RuleKind::Date => {
                parse_date_range(&self.value)?;
            }
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    /// Whether this rule forbids storing the given record.
    pub fn matches_record(&self, record: &Record) -> bool {
        match self.kind {
            RuleKind::Domain => is_string_match(&self.value, &record.domain),
            RuleKind::Keyword => record
                .keywords
                .iter()
                .any(|keyword| is_string_match(&self.value, keyword)),
            RuleKind::Date => match parse_date_range(&self.value) {
                Ok((start_ms, end_ms)) => {
                    record.timestamp_ms >= start_ms && record.timestamp_ms <= end_ms
                }
                Err(_) => false,
            },
        }
    }
}

fn regex_pattern(value: &str) -> Option<&str> {
    if value.starts_with("r/") && value.ends_with('/') && value.len() > 3 {
        Some(&value[2..value.len() - 1])
    } else {
        None
    }
}

pub fn is_string_match(match_query: &str, input: &str) -> bool {
    match regex_pattern(match_query) {
        Some(pattern) => match Regex::new(pattern) {
            Ok(regex) => regex.is_match(input),
            Err(err) => {
                log::warn!("skipping malformed rule pattern {match_query}: {err}");
                false
            }
        },
        None => input.to_lowercase().contains(&match_query.to_lowercase()),
    }
}

/// Parse an inclusive date range.
///
/// Accepts `start..end` where each side is either epoch milliseconds or a
/// `YYYY-MM-DD` day. A day on the end side covers through its last
/// millisecond.
pub fn parse_date_range(value: &str) -> anyhow::Result<(u64, u64)> {
    let (start_raw, end_raw) = value
        .split_once("..")
        .with_context(|| format!("date range must be start..end, got {value:?}"))?;

    let start_ms = parse_bound(start_raw.trim(), false)?;
    let end_ms = parse_bound(end_raw.trim(), true)?;

    if start_ms > end_ms {
        bail!("date range starts after it ends: {value}");
    }
    Ok((start_ms, end_ms))
}

fn parse_bound(raw: &str, is_end: bool) -> anyhow::Result<u64> {
    if raw.chars().all(|c| c.is_ascii_digit()) && !raw.is_empty() {
        return raw
            .parse::<u64>()
            .with_context(|| format!("invalid millisecond bound {raw:?}"));
    }

    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date bound {raw:?}, expected YYYY-MM-DD"))?;
    let day_start = date
        .and_hms_opt(0, 0, 0)
        .context("invalid day start")?
        .and_utc()
        .timestamp_millis();

    let ms = if is_end {
        // through the last millisecond of the day
        day_start + 24 * 60 * 60 * 1000 - 1
    } else {
        day_start
    };
    u64::try_from(ms).context("date bound before epoch")
}

/// All configured rules, persisted as rules.json.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<PrivacyRule>,
}

impl RuleSet {
    pub fn load(storage: &dyn StorageManager) -> Result<Self, StoreError> {
        if !storage.exists(RULES_FILE) {
            return Ok(Self::default());
        }
        let raw = storage.read(RULES_FILE)?;
        let rules = serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt {
            name: RULES_FILE.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self { rules })
    }

    pub fn save(&self, storage: &dyn StorageManager) -> Result<(), StoreError> {
        let raw = serde_json::to_vec_pretty(&self.rules).map_err(|err| StoreError::Corrupt {
            name: RULES_FILE.to_string(),
            reason: err.to_string(),
        })?;
        storage.write(RULES_FILE, &raw)
    }

    pub fn add(&mut self, rule: PrivacyRule) {
        self.rules.push(rule);
    }

    pub fn delete(&mut self, id: &Eid) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.id != *id);
        self.rules.len() < before
    }

    /// Flip a rule's status. Returns the new status, or None for an unknown
    /// id.
    pub fn toggle(&mut self, id: &Eid) -> Option<RuleStatus> {
        let rule = self.rules.iter_mut().find(|rule| rule.id == *id)?;
        rule.status = rule.status.flipped();
        Some(rule.status)
    }

    pub fn list(&self) -> &[PrivacyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First active rule forbidding the record, if any.
    pub fn first_blocking(&self, record: &Record) -> Option<&PrivacyRule> {
        self.rules
            .iter()
            .find(|rule| rule.is_active() && rule.matches_record(record))
    }
}
