pub mod api;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod fixture;
pub mod presence;
pub mod probe;
pub mod registry;
pub mod routine;
pub mod state;
pub mod store;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use engine::Engine;
pub use engine::EngineError;
