//! Secret broker client: authentication (static token or AppRole) and
//! leasing of dynamic database credentials.
//!
//! Layout:
//! - `credentials.rs`: leased credential and static connection facts
//! - `endpoints.rs`: stateless wire calls against the broker HTTP API
//! - `service.rs`: settings resolution, authentication and the read-only session

pub mod credentials;
mod endpoints;
pub mod service;

pub use credentials::{ConnectionFacts, LeasedCredential};
pub use service::{BrokerSession, BrokerSettings};
