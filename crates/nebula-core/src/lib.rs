//! nebula-core: Shared library for the NebulaLink fleet.
//!
//! This crate provides:
//! - Control-plane message definitions (typed `{type, payload}` frames)
//! - Archive streaming and safe extraction for directory transfers
//! - Agent identity derivation
//! - Error types shared by agent and master
//! - Logging setup and protocol/timing constants

pub mod archive;
pub mod constants;
pub mod error;
pub mod identity;
pub mod logging;
pub mod protocol;

pub use error::{Error, Result};
pub use identity::AgentIdentity;
pub use logging::{LogFormat, init_logging};
