mod engine;
mod semantic;

use crate::engine::{Engine, EngineFactory};

/// Creates an isolated engine using a unique temp directory.
/// Each test gets its own directory so parallel tests never collide,
/// and no real data is touched.
pub fn create_engine() -> (Engine, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let engine = EngineFactory::create_at(&tmp.path().to_string_lossy())
        .expect("failed to assemble engine");
    (engine, tmp)
}

/// Same as [`create_engine`] but with config overrides written first.
pub fn create_engine_with_config(yaml: &str) -> (Engine, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    std::fs::write(tmp.path().join("config.yaml"), yaml).expect("failed to write config");
    let engine = EngineFactory::create_at(&tmp.path().to_string_lossy())
        .expect("failed to assemble engine");
    (engine, tmp)
}
