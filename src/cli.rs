//! CLI surface for the server binary.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "cowrite-server",
    version,
    about = "Collaborative text editing server"
)]
pub struct Cli {
    /// TCP port to listen on (default: 8080).
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Worker threads (default: hardware concurrency, min 2).
    #[arg(long, value_name = "N")]
    pub threads: Option<u32>,

    /// Seconds between idle-session sweeps (default: 300).
    #[arg(long = "cleanup-interval", value_name = "SECONDS")]
    pub cleanup_interval: Option<u64>,

    /// Seconds of inactivity before a session is reaped (default: 3600).
    #[arg(long = "max-idle", value_name = "SECONDS")]
    pub max_idle: Option<u64>,

    /// Config file path (default: ./cowrite.toml if present).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

impl Cli {
    /// Flags beat config file and environment.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(threads) = self.threads {
            config.server.threads = Some(threads);
        }
        if let Some(secs) = self.cleanup_interval {
            config.server.cleanup_interval_secs = secs;
        }
        if let Some(secs) = self.max_idle {
            config.server.max_idle_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = parse_from([
            "cowrite-server",
            "--port",
            "9000",
            "--threads",
            "8",
            "--cleanup-interval",
            "30",
            "--max-idle",
            "120",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);

        let mut config = Config::default();
        cli.apply_to(&mut config);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.threads, Some(8));
        assert_eq!(config.server.cleanup_interval_secs, 30);
        assert_eq!(config.server.max_idle_secs, 120);
    }

    #[test]
    fn bare_invocation_changes_nothing() {
        let cli = parse_from(["cowrite-server"]);
        let mut config = Config::default();
        cli.apply_to(&mut config);
        assert_eq!(config, Config::default());
    }
}
