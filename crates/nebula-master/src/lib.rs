//! nebula-master: the NebulaLink master server.
//!
//! Owns the hub of agent control sessions, the peer-rendezvous and relay
//! coordinators, the status router, and the REST/WS/SSE surface.

pub mod api;
pub mod cli;
pub mod handlers;
pub mod hub;
pub mod sse;
pub mod status;
pub mod transfer;

pub use cli::Cli;
