use clap::Parser;
use std::path::PathBuf;

use crate::config_loader::HermesConfig;

/// Command-line flags for the hermes server. Flags override the config file
/// and environment.
#[derive(Debug, Parser)]
#[command(name = "hermes", version, about = "Storage telemetry and transfer service")]
pub struct Cli {
    /// TOML config file (defaults to ./hermes.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(long)]
    pub addr: Option<String>,

    /// Initial log level: debug, info, error or fatal
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn apply(&self, config: &mut HermesConfig) {
        if let Some(addr) = &self.addr {
            config.http_addr = addr.clone();
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from(["hermes", "--addr", "127.0.0.1:9000", "--log-level", "debug"]);
        let mut config = HermesConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.http_addr, "127.0.0.1:9000");
        assert_eq!(config.log.level, "debug");
        assert!(cli.config.is_none());
    }

    #[test]
    fn absent_flags_leave_config_alone() {
        let cli = Cli::parse_from(["hermes"]);
        let mut config = HermesConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.http_addr, "0.0.0.0:8080");
    }
}
