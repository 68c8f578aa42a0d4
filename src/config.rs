use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::semantic::features::DEFAULT_DIMENSIONS;
use crate::semantic::graph::{DEFAULT_MAX_EDGES_PER_NODE, DEFAULT_MIN_SIMILARITY};
use crate::semantic::lsh::DEFAULT_PROJECTIONS;
use crate::semantic::recall::MIN_VECTOR_RESULTS;
use crate::semantic::DEFAULT_THRESHOLD;
use crate::storage::{BackendLocal, StorageManager};

pub const CONFIG_FILE: &str = "config.yaml";

/// Default recall result count
const DEFAULT_LIMIT: usize = 10;
/// Default feature generation timeout in seconds
const DEFAULT_EMBED_TIMEOUT_SECS: u64 = 30;
/// Default daemon listen address
const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:48150";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStrategy {
    /// Brute-force scan, exact results
    Exact,
    /// Hyperplane LSH, faster on large stores at some recall cost
    Approximate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_strategy")]
    pub strategy: IndexStrategy,

    /// Signature bits used by the approximate strategy
    #[serde(default = "default_projections")]
    pub projections: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            projections: default_projections(),
        }
    }
}

fn default_strategy() -> IndexStrategy {
    IndexStrategy::Exact
}

fn default_projections() -> usize {
    DEFAULT_PROJECTIONS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_max_edges_per_node")]
    pub max_edges_per_node: usize,

    /// Minimum similarity for an edge [0.0, 1.0]
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_edges_per_node: default_max_edges_per_node(),
            min_similarity: default_min_similarity(),
        }
    }
}

fn default_max_edges_per_node() -> usize {
    DEFAULT_MAX_EDGES_PER_NODE
}

fn default_min_similarity() -> f32 {
    DEFAULT_MIN_SIMILARITY
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Default similarity threshold [0.0, 1.0]
    #[serde(default = "default_threshold")]
    pub default_threshold: f32,

    /// Vector result count below which keyword fallback kicks in
    #[serde(default = "default_min_vector_results")]
    pub min_vector_results: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_threshold: default_threshold(),
            min_vector_results: default_min_vector_results(),
        }
    }
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_min_vector_results() -> usize {
    MIN_VECTOR_RESULTS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Timeout for feature generation in seconds
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,

    /// Parallelism for bulk reindexing: "auto" or a positive integer
    #[serde(default = "default_parallelism")]
    pub parallelism: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_embed_timeout_secs(),
            parallelism: default_parallelism(),
        }
    }
}

fn default_embed_timeout_secs() -> u64 {
    DEFAULT_EMBED_TIMEOUT_SECS
}

fn default_parallelism() -> String {
    "auto".to_string()
}

impl EmbeddingConfig {
    /// None means let the thread pool decide.
    pub fn parallelism_threads(&self) -> Option<usize> {
        if self.parallelism == "auto" {
            None
        } else {
            self.parallelism.parse().ok()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Feature vector width
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub graph: GraphConfig,

    #[serde(default)]
    pub recall: RecallConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default = "default_daemon_addr")]
    pub daemon_addr: String,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            index: IndexConfig::default(),
            graph: GraphConfig::default(),
            recall: RecallConfig::default(),
            embedding: EmbeddingConfig::default(),
            daemon_addr: default_daemon_addr(),
            base_path: String::new(),
        }
    }
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_daemon_addr() -> String {
    DEFAULT_DAEMON_ADDR.to_string()
}

impl Config {
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(8..=4096).contains(&self.dimensions) {
            bail!("dimensions must be between 8 and 4096, got {}", self.dimensions);
        }

        if !(4..=32).contains(&self.index.projections) {
            bail!(
                "index.projections must be between 4 and 32, got {}",
                self.index.projections
            );
        }

        if !(1..=256).contains(&self.graph.max_edges_per_node) {
            bail!(
                "graph.max_edges_per_node must be between 1 and 256, got {}",
                self.graph.max_edges_per_node
            );
        }
        if !(0.0..=1.0).contains(&self.graph.min_similarity) {
            bail!(
                "graph.min_similarity must be between 0.0 and 1.0, got {}",
                self.graph.min_similarity
            );
        }

        if self.recall.default_limit == 0 {
            bail!("recall.default_limit must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.recall.default_threshold) {
            bail!(
                "recall.default_threshold must be between 0.0 and 1.0, got {}",
                self.recall.default_threshold
            );
        }

        if self.embedding.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be greater than 0");
        }
        if self.embedding.parallelism != "auto" {
            match self.embedding.parallelism.parse::<u32>() {
                Ok(n) if n > 0 => {}
                _ => bail!(
                    "embedding.parallelism must be 'auto' or a positive integer, got '{}'",
                    self.embedding.parallelism
                ),
            }
        }

        self.daemon_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("daemon_addr is not a socket address: {}", self.daemon_addr))?;

        Ok(())
    }

    pub fn load_with(base_path: &str) -> anyhow::Result<Self> {
        let store = BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            let fresh = serde_yml::to_string(&Self::default())?;
            store.write(CONFIG_FILE, fresh.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self =
            serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = BackendLocal::new(&self.base_path)?;
        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }
}
