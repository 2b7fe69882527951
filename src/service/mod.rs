pub mod compression;
pub mod initializer;
pub mod orchestrator;

pub use initializer::{Initialized, initialize_databases};
pub use orchestrator::Orchestrator;
