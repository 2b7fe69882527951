pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod service;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::VaultdumpError;
pub use service::Orchestrator;
pub use types::RunReport;
