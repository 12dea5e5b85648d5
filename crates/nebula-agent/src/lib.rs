//! nebula-agent: the NebulaLink remote agent.
//!
//! A long-running process that keeps a control session to the master,
//! reports host metrics, accepts lifecycle commands, and moves directories
//! to and from peer agents in direct (TCP) or relay (master-forwarded)
//! mode.

pub mod cli;
pub mod config;
pub mod endpoint;
pub mod handlers;
pub mod metrics;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod supervisor;
pub mod transfer;
pub mod worker;

pub use cli::Cli;
pub use config::AgentConfig;
