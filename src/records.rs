use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    sync::{Arc, RwLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as u64
}

/// One captured unit of content (a visited page) with derived metadata.
///
/// Identity is the deterministic `id`; upserting the same id replaces the
/// whole record.
#[derive(Debug, Clone, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,

    pub url: String,
    pub title: String,
    pub body: String,
    pub timestamp_ms: u64,
    pub keywords: Vec<String>,
    pub domain: String,
    pub session_id: String,

    pub tab_ref: Option<String>,
}

impl std::hash::Hash for Record {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Capture input before identity and domain are derived.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecordDraft {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_ref: Option<String>,
}

/// Deterministic record id: first 8 little-endian bytes of
/// sha256(url | timestamp).
pub fn record_id(url: &str, timestamp_ms: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp_ms.to_le_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Host part of a url, empty when the url does not parse.
pub fn domain_of(url_str: &str) -> String {
    url::Url::parse(url_str)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default()
}

pub fn parse_keywords(raw: String) -> Vec<String> {
    raw.split(',')
        .flat_map(|value| value.split(' ').filter(|value| !value.is_empty()))
        .map(|s| s.to_lowercase().to_string())
        .collect::<Vec<_>>()
}

impl Record {
    pub fn from_draft(draft: RecordDraft) -> Record {
        let timestamp_ms = draft.timestamp_ms.unwrap_or_else(now_ms);
        let id = record_id(&draft.url, timestamp_ms);
        let domain = domain_of(&draft.url);

        let mut keywords = draft.keywords;
        let mut seen = HashSet::new();
        keywords.retain(|kw| seen.insert(kw.to_lowercase()));

        Record {
            id,
            domain,
            timestamp_ms,
            url: draft.url,
            title: draft.title,
            body: draft.body,
            keywords: keywords.iter().map(|kw| kw.to_lowercase()).collect(),
            session_id: draft.session_id.unwrap_or_default(),
            tab_ref: draft.tab_ref,
        }
    }
}

/// Filter over the record table. Domain and session lookups go through the
/// secondary indices; the date range is inclusive on both ends.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecordQuery {
    pub id: Option<u64>,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub session_id: Option<String>,
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,

    #[serde(default)]
    pub limit: Option<usize>,
}

impl RecordQuery {
    fn is_unbounded(&self) -> bool {
        self.id.is_none()
            && self.url.is_none()
            && self.domain.is_none()
            && self.session_id.is_none()
            && self.since_ms.is_none()
            && self.until_ms.is_none()
    }
}

pub trait RecordManager: Send + Sync {
    /// Insert or fully replace a record by id.
    fn upsert(&self, record: Record) -> anyhow::Result<Record>;
    fn get(&self, id: u64) -> anyhow::Result<Option<Record>>;
    /// All records, newest first.
    fn get_all(&self, limit: Option<usize>) -> anyhow::Result<Vec<Record>>;
    fn query(&self, query: RecordQuery) -> anyhow::Result<Vec<Record>>;
    /// Removes one record, returning it so callers can cascade.
    fn delete(&self, id: u64) -> anyhow::Result<Option<Record>>;
    /// Removes every match, returning them so callers can cascade.
    fn delete_where(&self, query: RecordQuery) -> anyhow::Result<Vec<Record>>;
    fn total(&self) -> anyhow::Result<usize>;
}

#[derive(Debug, Default)]
struct Table {
    /// Sorted by timestamp descending; doubles as the timestamp index.
    rows: Vec<Record>,
    by_domain: HashMap<String, Vec<u64>>,
    by_session: HashMap<String, Vec<u64>>,
}

impl Table {
    fn rebuild_indices(&mut self) {
        self.by_domain.clear();
        self.by_session.clear();

        for record in &self.rows {
            self.by_domain
                .entry(record.domain.clone())
                .or_default()
                .push(record.id);
            self.by_session
                .entry(record.session_id.clone())
                .or_default()
                .push(record.id);
        }
    }

    fn insert_sorted(&mut self, record: Record) {
        let at = self
            .rows
            .partition_point(|r| r.timestamp_ms > record.timestamp_ms);
        self.rows.insert(at, record);
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendCsv {
    table: Arc<RwLock<Table>>,
    path: String,
}

const CSV_HEADERS: [&str; 9] = [
    "id",
    "url",
    "title",
    "body",
    "timestamp_ms",
    "keywords",
    "domain",
    "session_id",
    "tab_ref",
];

impl BackendCsv {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("creating new record table at {path}");
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(path)?;
        let iter = csv_reader.records();

        let mut rows = vec![];
        for row in iter {
            let row = row?;
            let id = row
                .get(0)
                .ok_or(anyhow!("couldnt get record id"))?
                .parse::<u64>()?;
            let url = row
                .get(1)
                .ok_or(anyhow!("couldnt get record url"))?
                .to_string();
            let title = row
                .get(2)
                .ok_or(anyhow!("couldnt get record title"))?
                .to_string();
            let body = row
                .get(3)
                .ok_or(anyhow!("couldnt get record body"))?
                .to_string();
            let timestamp_ms = row
                .get(4)
                .ok_or(anyhow!("couldnt get record timestamp"))?
                .parse::<u64>()?;
            let keywords = parse_keywords(
                row.get(5)
                    .ok_or(anyhow!("couldnt get record keywords"))?
                    .to_string(),
            );
            let domain = row
                .get(6)
                .ok_or(anyhow!("couldnt get record domain"))?
                .to_string();
            let session_id = row
                .get(7)
                .ok_or(anyhow!("couldnt get record session"))?
                .to_string();
            let tab_ref = row
                .get(8)
                .ok_or(anyhow!("couldnt get record tab ref"))?
                .to_string();

            rows.push(Record {
                id,
                url,
                title,
                body,
                timestamp_ms,
                keywords,
                domain,
                session_id,
                tab_ref: if tab_ref.is_empty() {
                    None
                } else {
                    Some(tab_ref)
                },
            });
        }

        rows.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

        let mut table = Table {
            rows,
            ..Default::default()
        };
        table.rebuild_indices();

        log::debug!(
            "took {}ms to read csv",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        Ok(BackendCsv {
            table: Arc::new(RwLock::new(table)),
            path: path.to_string(),
        })
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let table = self.table.read().unwrap();

        let temp_path = format!("{}-tmp", &self.path);
        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for record in table.rows.iter() {
            csv_wrt.write_record([
                &record.id.to_string(),
                &record.url,
                &record.title,
                &record.body,
                &record.timestamp_ms.to_string(),
                &record.keywords.join(","),
                &record.domain,
                &record.session_id,
                &record.tab_ref.clone().unwrap_or_default(),
            ])?;
        }
        csv_wrt.flush()?;
        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn matches(table: &Table, query: &RecordQuery) -> Vec<Record> {
        // secondary indices narrow the candidate set before the row scan
        let mut candidates: Option<HashSet<u64>> = None;
        if let Some(domain) = &query.domain {
            let ids = table.by_domain.get(domain).cloned().unwrap_or_default();
            candidates = Some(ids.into_iter().collect());
        }
        if let Some(session_id) = &query.session_id {
            let ids: HashSet<u64> = table
                .by_session
                .get(session_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect();
            candidates = Some(match candidates {
                Some(prev) => prev.intersection(&ids).copied().collect(),
                None => ids,
            });
        }

        let mut output = vec![];
        for record in table.rows.iter() {
            if let Some(candidates) = &candidates {
                if !candidates.contains(&record.id) {
                    continue;
                }
            }

            if let Some(id) = query.id {
                if record.id != id {
                    continue;
                }
            }

            if let Some(url) = &query.url {
                if !record.url.eq_ignore_ascii_case(url) {
                    continue;
                }
            }

            if let Some(since) = query.since_ms {
                if record.timestamp_ms < since {
                    continue;
                }
            }

            if let Some(until) = query.until_ms {
                if record.timestamp_ms > until {
                    continue;
                }
            }

            output.push(record.clone());

            let id_query = query.id.is_some();
            let limit_reached =
                query.limit.is_some() && output.len() >= query.limit.unwrap_or_default();

            if id_query || limit_reached {
                break;
            }
        }

        output
    }
}

impl RecordManager for BackendCsv {
    fn upsert(&self, record: Record) -> anyhow::Result<Record> {
        let mut table = self.table.write().unwrap();

        if let Some(idx) = table.rows.iter().position(|r| r.id == record.id) {
            table.rows.remove(idx);
        }
        table.insert_sorted(record.clone());
        table.rebuild_indices();

        drop(table);
        self.save()?;

        Ok(record)
    }

    fn get(&self, id: u64) -> anyhow::Result<Option<Record>> {
        let table = self.table.read().unwrap();
        Ok(table.rows.iter().find(|r| r.id == id).cloned())
    }

    fn get_all(&self, limit: Option<usize>) -> anyhow::Result<Vec<Record>> {
        let table = self.table.read().unwrap();
        let take = limit.unwrap_or(table.rows.len());
        Ok(table.rows.iter().take(take).cloned().collect())
    }

    fn query(&self, query: RecordQuery) -> anyhow::Result<Vec<Record>> {
        let table = self.table.read().unwrap();

        if query.is_unbounded() {
            let take = query.limit.unwrap_or(table.rows.len());
            return Ok(table.rows.iter().take(take).cloned().collect());
        }

        Ok(Self::matches(&table, &query))
    }

    fn delete(&self, id: u64) -> anyhow::Result<Option<Record>> {
        let mut table = self.table.write().unwrap();

        let removed = table
            .rows
            .iter()
            .position(|r| r.id == id)
            .map(|idx| table.rows.remove(idx));

        if removed.is_some() {
            table.rebuild_indices();
            drop(table);
            self.save()?;
        }

        Ok(removed)
    }

    fn delete_where(&self, query: RecordQuery) -> anyhow::Result<Vec<Record>> {
        let mut table = self.table.write().unwrap();

        let removed = Self::matches(&table, &query);
        if removed.is_empty() {
            return Ok(removed);
        }

        let removed_ids: HashSet<u64> = removed.iter().map(|r| r.id).collect();
        table.rows.retain(|r| !removed_ids.contains(&r.id));
        table.rebuild_indices();

        drop(table);
        self.save()?;

        Ok(removed)
    }

    fn total(&self) -> anyhow::Result<usize> {
        Ok(self.table.read().unwrap().rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(url: &str, ts: u64) -> RecordDraft {
        RecordDraft {
            url: url.to_string(),
            title: format!("page {ts}"),
            timestamp_ms: Some(ts),
            ..Default::default()
        }
    }

    fn temp_backend() -> (BackendCsv, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let backend = BackendCsv::load(path.to_str().unwrap()).unwrap();
        (backend, dir)
    }

    #[test]
    fn record_id_is_deterministic() {
        let a = record_id("https://example.com/a", 1000);
        let b = record_id("https://example.com/a", 1000);
        let c = record_id("https://example.com/a", 1001);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(domain_of("https://news.example.com/a?b=c"), "news.example.com");
        assert_eq!(domain_of("not a url"), "");
    }

    #[test]
    fn get_all_is_timestamp_descending() {
        let (backend, _dir) = temp_backend();

        backend
            .upsert(Record::from_draft(draft("https://a.test/1", 100)))
            .unwrap();
        backend
            .upsert(Record::from_draft(draft("https://a.test/2", 300)))
            .unwrap();
        backend
            .upsert(Record::from_draft(draft("https://a.test/3", 200)))
            .unwrap();

        let all = backend.get_all(None).unwrap();
        let stamps: Vec<u64> = all.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(stamps, vec![300, 200, 100]);

        let limited = backend.get_all(Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].timestamp_ms, 300);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let (backend, _dir) = temp_backend();

        let mut record = Record::from_draft(draft("https://a.test/1", 100));
        backend.upsert(record.clone()).unwrap();

        record.title = "replaced".to_string();
        backend.upsert(record.clone()).unwrap();

        assert_eq!(backend.total().unwrap(), 1);
        assert_eq!(backend.get(record.id).unwrap().unwrap().title, "replaced");
    }

    #[test]
    fn domain_query_uses_index() {
        let (backend, _dir) = temp_backend();

        backend
            .upsert(Record::from_draft(draft("https://a.test/1", 100)))
            .unwrap();
        backend
            .upsert(Record::from_draft(draft("https://b.test/2", 200)))
            .unwrap();

        let hits = backend
            .query(RecordQuery {
                domain: Some("a.test".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].domain, "a.test");
    }

    #[test]
    fn date_range_query_is_inclusive() {
        let (backend, _dir) = temp_backend();

        for ts in [100u64, 200, 300] {
            backend
                .upsert(Record::from_draft(draft(&format!("https://a.test/{ts}"), ts)))
                .unwrap();
        }

        let hits = backend
            .query(RecordQuery {
                since_ms: Some(100),
                until_ms: Some(200),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn delete_where_returns_removed_records() {
        let (backend, _dir) = temp_backend();

        backend
            .upsert(Record::from_draft(draft("https://a.test/1", 100)))
            .unwrap();
        backend
            .upsert(Record::from_draft(draft("https://a.test/2", 200)))
            .unwrap();
        backend
            .upsert(Record::from_draft(draft("https://b.test/3", 300)))
            .unwrap();

        let removed = backend
            .delete_where(RecordQuery {
                domain: Some("a.test".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(backend.total().unwrap(), 1);
    }

    #[test]
    fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let path_str = path.to_str().unwrap();

        let record = {
            let backend = BackendCsv::load(path_str).unwrap();
            let mut draft = draft("https://a.test/1", 100);
            draft.keywords = vec!["cats".to_string(), "pets".to_string()];
            backend.upsert(Record::from_draft(draft)).unwrap()
        };

        let backend = BackendCsv::load(path_str).unwrap();
        let loaded = backend.get(record.id).unwrap().unwrap();
        assert_eq!(loaded.url, "https://a.test/1");
        assert_eq!(loaded.keywords, vec!["cats", "pets"]);
        assert_eq!(loaded.tab_ref, None);
    }
}
