//! Command-line surface, kept thin: parse flags, hand a [`SessionConfig`] to
//! the supervisor. No subcommands — this binary does one thing.

use clap::{ArgAction, Parser};

use crate::config::{parse_forward_spec, ConfigError, SessionConfig};

const DEFAULT_HOSTNAME: &str = "tunnel.example.com";

#[derive(Parser, Debug)]
#[command(name = "tunnel-agent")]
#[command(author, version, about = "Expose local services through a relay tunnel", long_about = None)]
#[command(disable_help_flag = true)]
pub struct Cli {
    /// Print help.
    #[arg(long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// Forwarding route: <name>|<localTarget> or <name>|<label>|<localTarget>.
    /// Repeatable; at least one is required.
    #[arg(short = 'f', long = "forward", required = true)]
    pub forward: Vec<String>,

    /// API key used to authenticate with the relay.
    #[arg(short = 'k', long = "key")]
    pub key: String,

    /// Relay hostname to connect to.
    #[arg(short = 'h', long = "host", default_value = DEFAULT_HOSTNAME)]
    pub host: String,

    /// Disable TLS on the connection to the relay.
    #[arg(short = 'n', long = "non-secure")]
    pub non_secure: bool,

    /// Log level.
    #[arg(short = 'l', long = "log", default_value = "info")]
    pub log: String,

    /// Accepted for compatibility; folded into the log filter.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Parse and validate `std::env::args` into a [`SessionConfig`].
    pub fn into_session_config(self) -> Result<SessionConfig, ConfigError> {
        let mut tunnels = Vec::with_capacity(self.forward.len());
        for spec in &self.forward {
            tunnels.push(parse_forward_spec(spec)?);
        }
        SessionConfig::new(tunnels, self.key, self.host, !self.non_secure)
    }

    /// The effective `tracing` filter directive for this invocation.
    pub fn log_filter(&self) -> String {
        if self.debug {
            "debug".to_string()
        } else {
            self.log.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_minimal_invocation() {
        let cli = Cli::parse_from([
            "tunnel-agent",
            "-f",
            "app|http://127.0.0.1:8080",
            "-k",
            "secret",
        ]);
        assert_eq!(cli.forward, vec!["app|http://127.0.0.1:8080".to_string()]);
        assert_eq!(cli.host, DEFAULT_HOSTNAME);
        assert!(!cli.non_secure);
    }

    #[test]
    fn test_into_session_config_builds_valid_config() {
        let cli = Cli::parse_from([
            "tunnel-agent",
            "-f",
            "app|http://127.0.0.1:8080",
            "-k",
            "secret",
            "-n",
        ]);
        let cfg = cli.into_session_config().unwrap();
        assert_eq!(cfg.tunnels.len(), 1);
        assert!(!cfg.secure);
    }

    #[test]
    fn test_requires_at_least_one_forward() {
        let result = Cli::try_parse_from(["tunnel-agent", "-k", "secret"]);
        assert!(result.is_err());
    }
}
