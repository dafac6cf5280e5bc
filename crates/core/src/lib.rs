pub mod bitmaps;
pub mod counters;
pub mod debug;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod gesture;
pub mod loader;
pub mod logger;
pub mod matcher;
pub mod model;
pub mod platform;
pub mod processor;
pub mod scaling;
pub mod settings;
pub mod sleep;
pub mod state;
pub mod supervisor;
pub mod types;
pub mod validate;

pub use engine::{EngineConfig, EngineHandle, ScenarioEngine};
pub use error::{BitmapError, EngineError};
pub use model::Scenario;
pub use types::{EngineState, StopReason};
