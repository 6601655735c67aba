//! Command-line arguments shared by fieldlink services

use std::path::PathBuf;

use clap::Parser;

/// Common service startup arguments
#[derive(Debug, Clone, Default, Parser)]
#[clap(author, version, about)]
pub struct ServiceArgs {
    /// Configuration file (toml, yaml or json)
    #[clap(short = 'c', long, env = "FIELDLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[clap(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[clap(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[clap(long)]
    pub validate: bool,
}

impl ServiceArgs {
    /// Parse a level name, defaulting to INFO
    pub fn parse_log_level(&self) -> tracing::Level {
        match self
            .log_level
            .as_deref()
            .map(str::to_lowercase)
            .as_deref()
        {
            Some("trace") => tracing::Level::TRACE,
            Some("debug") => tracing::Level::DEBUG,
            Some("warn") | Some("warning") => tracing::Level::WARN,
            Some("error") => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}
