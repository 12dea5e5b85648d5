//! Agent CLI.
//!
//! `agent <agent-name>` runs in the foreground; the verbs manage the OS
//! service registration.

use clap::{Parser, Subcommand};

/// NebulaLink agent - fleet endpoint for metrics, lifecycle and transfer.
#[derive(Debug, Parser)]
#[command(
    name = "agent",
    version,
    about = "NebulaLink agent - fleet endpoint for metrics, lifecycle and transfer"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Agent name (runs in the foreground)
    #[arg(value_name = "AGENT-NAME", required_unless_present = "command")]
    pub agent_name: Option<String>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install as an OS service with auto-start and restart policy
    Install {
        #[arg(value_name = "AGENT-NAME")]
        agent_name: String,
    },
    /// Stop and remove the installed service
    Uninstall {
        #[arg(value_name = "AGENT-NAME")]
        agent_name: String,
    },
    /// Start the installed service
    Start {
        #[arg(value_name = "AGENT-NAME")]
        agent_name: String,
    },
    /// Stop the installed service
    Stop {
        #[arg(value_name = "AGENT-NAME")]
        agent_name: String,
    },
}

impl Cli {
    /// The agent name, wherever it was given.
    pub fn agent_name(&self) -> &str {
        match &self.command {
            Some(
                Command::Install { agent_name }
                | Command::Uninstall { agent_name }
                | Command::Start { agent_name }
                | Command::Stop { agent_name },
            ) => agent_name,
            None => self
                .agent_name
                .as_deref()
                .expect("clap enforces the name in run mode"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_run_mode() {
        let cli = Cli::try_parse_from(["agent", "branch-agent-01"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.agent_name(), "branch-agent-01");
    }

    #[test]
    fn parse_install() {
        let cli = Cli::try_parse_from(["agent", "install", "branch-agent-01"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Install { .. })));
        assert_eq!(cli.agent_name(), "branch-agent-01");
    }

    #[test]
    fn parse_lifecycle_verbs() {
        for verb in ["uninstall", "start", "stop"] {
            let cli = Cli::try_parse_from(["agent", verb, "a1"]).unwrap();
            assert!(cli.command.is_some());
            assert_eq!(cli.agent_name(), "a1");
        }
    }

    #[test]
    fn missing_name_is_usage_error() {
        assert!(Cli::try_parse_from(["agent"]).is_err());
        assert!(Cli::try_parse_from(["agent", "install"]).is_err());
    }

    #[test]
    fn parse_verbosity() {
        let cli = Cli::try_parse_from(["agent", "-vv", "a1"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
