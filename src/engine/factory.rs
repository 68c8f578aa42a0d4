use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use homedir::my_home;

use crate::config::{Config, IndexStrategy};
use crate::lock::FileLock;
use crate::records::BackendCsv;
use crate::rules::RuleSet;
use crate::semantic::features::FeatureGenerator;
use crate::semantic::graph::SemanticGraph;
use crate::semantic::index::{ExactIndex, VectorIndex};
use crate::semantic::lsh::LshIndex;
use crate::semantic::storage::{model_id, VectorStorage};
use crate::sessions::load_sessions;
use crate::storage::BackendLocal;

use super::core::{Engine, EngineState};

/// Engine factory for assembling a fully wired engine from a dataset
/// directory.
pub struct EngineFactory;

impl EngineFactory {
    /// Create an engine on the default dataset, with the worker running.
    pub fn create() -> Result<Engine> {
        let base_path = Self::base_path()?;
        Self::create_at(&base_path)
    }

    /// Create an engine on an explicit dataset directory.
    ///
    /// Takes the dataset lock for the lifetime of the engine, so a daemon
    /// and a CLI invocation never write the same files concurrently.
    pub fn create_at(base_path: &str) -> Result<Engine> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create dataset directory {base_path}"))?;

        let config = Config::load_with(base_path)?;
        let lock = FileLock::try_acquire(Path::new(base_path))
            .context("another recall process holds the dataset lock")?;

        let mut engine = Engine::new(Self::build_state(config)?, Some(lock));
        engine.run_worker();
        Ok(engine)
    }

    /// Resolve the dataset directory, `RECALL_BASE_PATH` or the default
    /// under the user's home.
    pub fn base_path() -> Result<String> {
        if let Ok(path) = std::env::var("RECALL_BASE_PATH") {
            return Ok(path);
        }

        let home = my_home()?.context("home directory path is empty")?;
        Ok(format!("{}/.local/share/recall", home.to_string_lossy()))
    }

    fn build_state(config: Config) -> Result<EngineState> {
        let storage = BackendLocal::new(config.base_path())?;

        let records_path = storage.file_path("records.csv");
        let records = BackendCsv::load(&records_path.to_string_lossy())?;

        let generator = FeatureGenerator::new(config.dimensions);
        let model_id = model_id(&generator.model_tag());

        let vector_storage = VectorStorage::new(storage.file_path("vectors.bin"));
        let vectors = if vector_storage.exists() {
            match vector_storage.load(&model_id, config.dimensions) {
                Ok(vectors) => vectors,
                Err(err) => {
                    log::warn!("stored vectors are unusable ({err}), starting empty; run reindex to regenerate");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut index: Box<dyn VectorIndex> = match config.index.strategy {
            IndexStrategy::Exact => Box::new(ExactIndex::new()),
            IndexStrategy::Approximate => Box::new(LshIndex::new(config.index.projections)),
        };
        for vector in &vectors {
            index.add(vector.record_id, vector.components.clone())?;
        }

        let graph = SemanticGraph::load(
            &storage,
            config.graph.max_edges_per_node,
            config.graph.min_similarity,
        )?;
        let rules = RuleSet::load(&storage)?;
        let sessions = load_sessions(&storage)?;

        Ok(EngineState {
            records: Arc::new(records),
            storage: Arc::new(storage),
            index: RwLock::new(index),
            vectors: RwLock::new(vectors),
            graph: RwLock::new(graph),
            rules: RwLock::new(rules),
            sessions: RwLock::new(sessions),
            generator,
            vector_storage,
            model_id,
            config,
        })
    }
}
