pub mod command;
pub mod core;
pub mod errors;
pub mod factory;
pub mod worker;

pub use command::{dispatch, Command, CommandResponse};
pub use core::{CaptureOutcome, Engine, EngineState, ReindexReport, StoreStats};
pub use errors::EngineError;
pub use factory::EngineFactory;
