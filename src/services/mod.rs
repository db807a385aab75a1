pub mod engine;
pub mod notifier;

pub use engine::{Engine, EngineCommand, EngineHandle, EngineTimings};
pub use notifier::Notifier;
