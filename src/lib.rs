//! FaultRelay Library
//!
//! A fault-injecting TCP relay for provoking acknowledgment loss in
//! client/server protocols. The relay forwards bytes between a client and a
//! target endpoint and can be told to silently discard the target-to-client
//! direction, so that responses (e.g. write acknowledgments) are lost rather
//! than delayed and the client's retry behavior can be observed.

pub mod config;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use relay::Relay;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
