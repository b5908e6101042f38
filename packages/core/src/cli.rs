use clap::Parser;

use crate::config::Config;

/// XCA monitor CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "xca-monitor",
    version,
    about = "Watch social accounts for contract addresses and forward them to chat"
)]
pub struct Cli {
    /// SQLite database URL (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Check interval in minutes (overrides MONITORING_CHECK_INTERVAL_MINUTES)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub check_interval: Option<u64>,

    /// HTTP API port (overrides API_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Start monitoring as soon as the service is up
    #[arg(long)]
    pub auto_start: bool,

    /// Run a single check, print a summary, and exit
    #[arg(long, conflicts_with = "auto_start")]
    pub once: bool,
}

impl Cli {
    /// Layer command-line overrides on top of the environment config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if let Some(minutes) = self.check_interval {
            config.monitoring.check_interval_minutes = minutes;
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
    }
}
