//! fabric-native-host library
//!
//! Native messaging bridge between a browser extension and the fabric-ai
//! CLI:
//! - Length-prefixed JSON framing and wire schema (`transport`)
//! - fabric-ai command construction and process seams (`fabric`)
//! - Supervision of concurrent streaming operations (`supervisor`)
//! - Request validation and dispatch (`router`)
//! - The peer-side connection/correlation state machine (`client`)

pub mod client;
pub mod config;
pub mod fabric;
pub mod router;
pub mod supervisor;
pub mod transport;
