//! Master CLI.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for nebula_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => nebula_core::LogFormat::Text,
            CliLogFormat::Json => nebula_core::LogFormat::Json,
        }
    }
}

/// NebulaLink master - fleet coordinator and transfer broker.
#[derive(Debug, Parser)]
#[command(
    name = "nebula-master",
    version,
    about = "NebulaLink master - fleet coordinator and transfer broker"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value = "8080", env = "MASTER_PORT")]
    pub port: u16,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// The socket address to bind to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            verbose: 0,
            log_file: None,
            log_format: CliLogFormat::Text,
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
    fn default_values() {
        let cli = Cli::try_parse_from(["nebula-master"]).unwrap();
        assert_eq!(cli.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(cli.port, 8080);
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.log_format, CliLogFormat::Text);
    }

    #[test]
    fn parse_bind_and_port() {
        let cli =
            Cli::try_parse_from(["nebula-master", "-b", "127.0.0.1", "-p", "9000"]).unwrap();
        assert_eq!(
            cli.socket_addr(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn parse_log_format() {
        let cli = Cli::try_parse_from(["nebula-master", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, CliLogFormat::Json);
    }

    #[test]
    fn parse_verbosity() {
        let cli = Cli::try_parse_from(["nebula-master", "-vvv"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }
}
