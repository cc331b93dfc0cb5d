//! Data Relay Module
//!
//! Accepts client connections, pairs each with an outbound connection to the
//! target, and pumps bytes in both directions. The target-to-client direction
//! can be put into drop mode, where read bytes are discarded instead of
//! forwarded.

pub mod engine;
pub mod pump;
pub mod registry;

pub use engine::Relay;
pub use registry::{ConnectionInfo, ConnectionRegistry};
