pub mod agents;
pub mod catalog;
pub mod config;
pub mod delegation;
pub mod error;
pub mod gate;
pub mod journal;
pub mod lifecycle;
pub mod machine;
pub mod mock;
pub mod projection;
pub mod stream;
pub mod supervisor;
pub mod tools;

pub use config::EngineConfig;
pub use error::EngineError;
pub use supervisor::RunSupervisor;
