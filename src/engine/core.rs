use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::Config;
use crate::eid::Eid;
use crate::lock::FileLock;
use crate::records::{now_ms, Record, RecordDraft, RecordManager, RecordQuery};
use crate::rules::{parse_date_range, PrivacyRule, RuleKind, RuleSet};
use crate::semantic::features::FeatureGenerator;
use crate::semantic::graph::{self, SemanticGraph};
use crate::semantic::index::VectorIndex;
use crate::semantic::recall::{self, Match};
use crate::semantic::storage::{StoredVector, VectorStorage, VectorStorageError};
use crate::sessions::{self, Session, SessionDiff};
use crate::storage::StorageManager;

use super::errors::EngineError;
use super::worker::{self, EmbedOutcome, Task};

/// Collection files that make up a dataset, for stats and backup.
pub const DATA_FILES: [&str; 6] = [
    "records.csv",
    "vectors.bin",
    "edges.json",
    "sessions.json",
    "clusters.json",
    "rules.json",
];

/// Everything the engine and its worker share.
///
/// Lock order is index, then vectors, then graph; never take them in any
/// other order when holding more than one.
pub struct EngineState {
    pub records: Arc<dyn RecordManager>,
    pub storage: Arc<dyn StorageManager>,
    pub index: RwLock<Box<dyn VectorIndex>>,
    pub vectors: RwLock<Vec<StoredVector>>,
    pub graph: RwLock<SemanticGraph>,
    pub rules: RwLock<RuleSet>,
    pub sessions: RwLock<Vec<Session>>,
    pub generator: FeatureGenerator,
    pub vector_storage: VectorStorage,
    pub model_id: [u8; 32],
    pub config: Config,
}

impl EngineState {
    fn persist_vectors(&self) -> Result<(), VectorStorageError> {
        let vectors = self.vectors.read().unwrap();
        self.vector_storage
            .save(&vectors, &self.model_id, self.generator.dimensions())
    }

    fn persist_sessions(&self) -> Result<(), EngineError> {
        let rows = self.sessions.read().unwrap();
        sessions::save_sessions(self.storage.as_ref(), &rows)?;
        Ok(())
    }

    fn refresh_clusters(&self) -> Result<usize, EngineError> {
        let clusters = self.graph.read().unwrap().rebuild_clusters();
        graph::save_clusters(self.storage.as_ref(), &clusters)?;
        Ok(clusters.len())
    }

    /// Persist one record's vector and rebuild its edges. Runs on the worker
    /// thread during capture and inline during reindex.
    pub(super) fn store_vector(
        &self,
        record_id: u64,
        components: Vec<f32>,
    ) -> Result<(), EngineError> {
        self.index
            .write()
            .unwrap()
            .add(record_id, components.clone())?;

        {
            let mut vectors = self.vectors.write().unwrap();
            vectors.retain(|v| v.record_id != record_id);
            vectors.push(StoredVector {
                record_id,
                generated_at_ms: now_ms(),
                components: components.clone(),
            });
        }
        self.persist_vectors()?;

        {
            let index = self.index.read().unwrap();
            let mut graph = self.graph.write().unwrap();
            graph.add_node(record_id, &components, index.as_ref())?;
            graph.save(self.storage.as_ref())?;
        }
        self.refresh_clusters()?;

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// Record stored; `embedded` is false when the vector had to be skipped
    /// and the record is keyword-searchable only.
    Stored { id: u64, embedded: bool },
    /// A privacy rule forbids this capture. Not an error.
    Blocked { rule_id: Eid },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDiffReport {
    #[serde(flatten)]
    pub diff: SessionDiff,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub vectors: usize,
    pub edges: usize,
    pub sessions: usize,
    pub rules: usize,
    pub clusters: usize,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub records: usize,
    pub edges: usize,
    pub clusters: usize,
}

pub struct Engine {
    state: Arc<EngineState>,

    task_tx: Option<mpsc::Sender<Task>>,
    worker_handle: Option<std::thread::JoinHandle<()>>,

    _lock: Option<FileLock>,
}

impl Engine {
    pub fn new(state: EngineState, lock: Option<FileLock>) -> Self {
        Self {
            state: Arc::new(state),
            task_tx: None,
            worker_handle: None,
            _lock: lock,
        }
    }

    pub fn run_worker(&mut self) {
        let (task_tx, handle) = worker::spawn(self.state.clone());
        self.task_tx = Some(task_tx);
        self.worker_handle = Some(handle);
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Store a record unless a privacy rule forbids it.
    ///
    /// The record is keyword-searchable as soon as this returns; the vector
    /// is generated on the worker with a bounded wait, and a timeout demotes
    /// the capture to keyword-only instead of failing it.
    pub fn capture(&self, draft: RecordDraft) -> Result<CaptureOutcome, EngineError> {
        let record = Record::from_draft(draft);

        let blocking = self
            .state
            .rules
            .read()
            .unwrap()
            .first_blocking(&record)
            .map(|rule| rule.id.clone());
        if let Some(rule_id) = blocking {
            log::info!("capture of {} blocked by rule {rule_id}", record.url);
            return Ok(CaptureOutcome::Blocked { rule_id });
        }

        let record = self.state.records.upsert(record)?;
        self.ensure_session(&record)?;

        let embedded = match self.wait_for_embedding(record.id) {
            Ok(()) => true,
            Err(EngineError::EmbeddingTimeout) => {
                log::warn!(
                    "feature generation for record {} timed out, keeping it keyword-searchable only",
                    record.id
                );
                false
            }
            Err(EngineError::EmbeddingFailed(msg)) => {
                log::warn!("feature generation for record {} failed: {msg}", record.id);
                false
            }
            Err(other) => return Err(other),
        };

        Ok(CaptureOutcome::Stored {
            id: record.id,
            embedded,
        })
    }

    fn ensure_session(&self, record: &Record) -> Result<(), EngineError> {
        if record.session_id.is_empty() {
            return Ok(());
        }

        let known = self
            .state
            .sessions
            .read()
            .unwrap()
            .iter()
            .any(|s| s.id == record.session_id);
        if known {
            return Ok(());
        }

        self.state.sessions.write().unwrap().push(Session {
            id: record.session_id.clone(),
            start_time_ms: record.timestamp_ms,
            end_time_ms: None,
            keywords: Vec::new(),
        });
        self.state.persist_sessions()
    }

    fn wait_for_embedding(&self, record_id: u64) -> Result<(), EngineError> {
        let Some(task_tx) = &self.task_tx else {
            // no worker running, generate inline
            let record = self
                .state
                .records
                .get(record_id)?
                .ok_or(EngineError::NotFound)?;
            let components =
                self.state
                    .generator
                    .generate(&record.title, &record.body, &record.keywords);
            return self.state.store_vector(record_id, components);
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        task_tx
            .send(Task::Embed {
                record_id,
                cancelled: cancelled.clone(),
                done_tx,
            })
            .map_err(|_| EngineError::EmbeddingFailed("worker is gone".to_string()))?;

        let timeout = Duration::from_secs(self.state.config.embedding.timeout_secs);
        match done_rx.recv_timeout(timeout) {
            Ok(EmbedOutcome::Stored) => Ok(()),
            Ok(EmbedOutcome::Skipped) => {
                Err(EngineError::EmbeddingFailed("vector was cancelled".to_string()))
            }
            Ok(EmbedOutcome::Failed(msg)) => Err(EngineError::EmbeddingFailed(msg)),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                cancelled.store(true, Ordering::SeqCst);
                Err(EngineError::EmbeddingTimeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(EngineError::EmbeddingFailed("worker dropped the task".to_string()))
            }
        }
    }

    pub fn search(
        &self,
        query: &str,
        limit: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<Match>, EngineError> {
        let limit = limit.unwrap_or(self.state.config.recall.default_limit);
        let threshold = threshold.unwrap_or(self.state.config.recall.default_threshold);

        let records = self.state.records.get_all(None)?;
        let index = self.state.index.read().unwrap();
        let matches = recall::search(
            &records,
            index.as_ref(),
            &self.state.generator,
            query,
            limit,
            threshold,
        )?;
        Ok(matches)
    }

    /// Records linked to the given one, strongest edge first.
    pub fn neighbors(&self, id: u64, limit: Option<usize>) -> Result<Vec<Record>, EngineError> {
        if self.state.records.get(id)?.is_none() {
            return Err(EngineError::NotFound);
        }

        let limit = limit.unwrap_or(self.state.config.recall.default_limit);
        let edges = self.state.graph.read().unwrap().neighbors(id, limit);

        let mut out = Vec::with_capacity(edges.len());
        for edge in edges {
            if let Some(record) = self.state.records.get(edge.to_id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn forget_domain(&self, domain: &str) -> Result<usize, EngineError> {
        let removed = self.state.records.delete_where(RecordQuery {
            domain: Some(domain.to_string()),
            ..Default::default()
        })?;
        self.cascade_removal(&removed)?;
        Ok(removed.len())
    }

    /// `range` is `start..end`, accepting epoch milliseconds or YYYY-MM-DD
    /// bounds, both inclusive.
    pub fn forget_date_range(&self, range: &str) -> Result<usize, EngineError> {
        let (since_ms, until_ms) = parse_date_range(range)?;
        let removed = self.state.records.delete_where(RecordQuery {
            since_ms: Some(since_ms),
            until_ms: Some(until_ms),
            ..Default::default()
        })?;
        self.cascade_removal(&removed)?;
        Ok(removed.len())
    }

    /// Remove everything derived from records that just left the store:
    /// vectors, incident edges and stale clusters.
    fn cascade_removal(&self, removed: &[Record]) -> Result<(), EngineError> {
        if removed.is_empty() {
            return Ok(());
        }

        {
            let mut index = self.state.index.write().unwrap();
            for record in removed {
                index.remove(record.id);
            }
        }
        {
            let gone: HashSet<u64> = removed.iter().map(|r| r.id).collect();
            let mut vectors = self.state.vectors.write().unwrap();
            vectors.retain(|v| !gone.contains(&v.record_id));
        }
        self.state.persist_vectors()?;

        {
            let mut graph = self.state.graph.write().unwrap();
            for record in removed {
                graph.detach(record.id);
            }
            graph.save(self.state.storage.as_ref())?;
        }
        self.state.refresh_clusters()?;

        log::info!(
            "forgot {} records; {} remain, {} vectors, {} edges",
            removed.len(),
            self.state.records.total()?,
            self.state.index.read().unwrap().len(),
            self.state.graph.read().unwrap().edge_count(),
        );
        Ok(())
    }

    pub fn export(&self) -> Result<Vec<Record>, EngineError> {
        Ok(self.state.records.get_all(None)?)
    }

    pub fn diff_sessions(&self, a: &str, b: &str) -> Result<SessionDiffReport, EngineError> {
        let members_a = self.session_members(a)?;
        let members_b = self.session_members(b)?;

        Ok(SessionDiffReport {
            diff: sessions::diff(&members_a, &members_b),
            similarity: sessions::similarity(&members_a, &members_b),
        })
    }

    pub fn merge_sessions(&self, a: &str, b: &str) -> Result<Session, EngineError> {
        if a == b {
            return Err(anyhow!("cannot merge a session with itself").into());
        }

        let members_a = self.session_members(a)?;
        let members_b = self.session_members(b)?;

        let row_a = self
            .session_row(a, &members_a)
            .ok_or_else(|| EngineError::SessionNotFound(a.to_string()))?;
        let row_b = self
            .session_row(b, &members_b)
            .ok_or_else(|| EngineError::SessionNotFound(b.to_string()))?;

        let keywords =
            sessions::merged_keywords(&[members_a.as_slice(), members_b.as_slice()]);
        let merged = row_a.merged(&row_b, keywords);
        let (winners, losers) = sessions::merge_members(&members_a, &members_b);

        // records displaced by the merge leave the store entirely
        let mut removed = Vec::with_capacity(losers.len());
        for id in losers {
            if let Some(record) = self.state.records.delete(id)? {
                removed.push(record);
            }
        }
        self.cascade_removal(&removed)?;

        for mut record in winners {
            if record.session_id != merged.id {
                record.session_id = merged.id.clone();
                self.state.records.upsert(record)?;
            }
        }

        {
            let mut rows = self.state.sessions.write().unwrap();
            rows.retain(|s| s.id != a && s.id != b);
            rows.push(merged.clone());
        }
        self.state.persist_sessions()?;

        Ok(merged)
    }

    fn session_members(&self, session_id: &str) -> Result<Vec<Record>, EngineError> {
        Ok(self.state.records.query(RecordQuery {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        })?)
    }

    /// A session is known if it has a row or any member records. Member-only
    /// sessions get a row derived from their timestamps.
    fn session_row(&self, id: &str, members: &[Record]) -> Option<Session> {
        if let Some(row) = self
            .state
            .sessions
            .read()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
        {
            return Some(row.clone());
        }

        if members.is_empty() {
            return None;
        }
        Some(Session {
            id: id.to_string(),
            start_time_ms: members.iter().map(|r| r.timestamp_ms).min().unwrap_or(0),
            end_time_ms: members.iter().map(|r| r.timestamp_ms).max(),
            keywords: Vec::new(),
        })
    }

    pub fn add_rule(&self, kind: RuleKind, value: String) -> Result<PrivacyRule, EngineError> {
        let rule = PrivacyRule::new(kind, value);
        rule.validate()?;

        let mut rules = self.state.rules.write().unwrap();
        rules.add(rule.clone());
        rules.save(self.state.storage.as_ref())?;
        Ok(rule)
    }

    pub fn delete_rule(&self, id: &Eid) -> Result<(), EngineError> {
        let mut rules = self.state.rules.write().unwrap();
        if !rules.delete(id) {
            return Err(EngineError::RuleNotFound);
        }
        rules.save(self.state.storage.as_ref())?;
        Ok(())
    }

    pub fn toggle_rule(&self, id: &Eid) -> Result<PrivacyRule, EngineError> {
        let mut rules = self.state.rules.write().unwrap();
        if rules.toggle(id).is_none() {
            return Err(EngineError::RuleNotFound);
        }
        rules.save(self.state.storage.as_ref())?;

        let rule = rules
            .list()
            .iter()
            .find(|rule| rule.id == *id)
            .cloned()
            .ok_or(EngineError::RuleNotFound)?;
        Ok(rule)
    }

    pub fn list_rules(&self) -> Vec<PrivacyRule> {
        self.state.rules.read().unwrap().list().to_vec()
    }

    pub fn stats(&self) -> Result<StoreStats, EngineError> {
        // index guard is not held across the graph lock below
        let vectors = self.state.index.read().unwrap().len();
        let graph = self.state.graph.read().unwrap();
        let disk_bytes = DATA_FILES
            .iter()
            .map(|name| self.state.storage.size_of(name))
            .sum();

        Ok(StoreStats {
            records: self.state.records.total()?,
            vectors,
            edges: graph.edge_count(),
            sessions: self.state.sessions.read().unwrap().len(),
            rules: self.state.rules.read().unwrap().len(),
            clusters: graph.cluster_count(),
            disk_bytes,
        })
    }

    /// Re-embed every record and rebuild the index, edges and clusters from
    /// scratch. Generation runs in parallel; persistence stays sequential.
    pub fn reindex(&self) -> Result<ReindexReport, EngineError> {
        let records = self.state.records.get_all(None)?;
        let bar = ProgressBar::new(records.len() as u64);

        let generate_all = || -> Vec<StoredVector> {
            records
                .par_iter()
                .map(|record| {
                    let components = self.state.generator.generate(
                        &record.title,
                        &record.body,
                        &record.keywords,
                    );
                    bar.inc(1);
                    StoredVector {
                        record_id: record.id,
                        generated_at_ms: now_ms(),
                        components,
                    }
                })
                .collect()
        };

        let computed = match self.state.config.embedding.parallelism_threads() {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|err| anyhow!("failed to build reindex pool: {err}"))?
                .install(generate_all),
            None => generate_all(),
        };
        bar.finish_and_clear();

        {
            let mut index = self.state.index.write().unwrap();
            index.clear();
            for vector in &computed {
                index.add(vector.record_id, vector.components.clone())?;
            }
        }
        *self.state.vectors.write().unwrap() = computed;
        self.state.persist_vectors()?;

        let edges = {
            let index = self.state.index.read().unwrap();
            let vectors = self.state.vectors.read().unwrap();
            let mut graph = SemanticGraph::new(
                self.state.config.graph.max_edges_per_node,
                self.state.config.graph.min_similarity,
            );
            for vector in vectors.iter() {
                graph.add_node(vector.record_id, &vector.components, index.as_ref())?;
            }
            graph.save(self.state.storage.as_ref())?;
            let edges = graph.edge_count();
            *self.state.graph.write().unwrap() = graph;
            edges
        };
        let clusters = self.state.refresh_clusters()?;

        Ok(ReindexReport {
            records: records.len(),
            edges,
            clusters,
        })
    }

    pub fn shutdown(&mut self) {
        if let Some(task_tx) = self.task_tx.take() {
            let _ = task_tx.send(Task::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
