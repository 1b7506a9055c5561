use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the shelfcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "shelfcache",
    version,
    about = "Tag-indexed response cache with real-time fan-out"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "SHELFCACHE_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service (default).
    Serve(Box<ServeArgs>),
    /// Run a single cache warm cycle against the configured base URL and exit.
    Warm(WarmArgs),
    /// Print cache statistics for the configured backing store as JSON.
    Stats(StatsArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverride {
    /// Override the backing store URL (`redis://...` or `memory://`).
    #[arg(long = "store-url", value_name = "URL")]
    pub store_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the externally reachable base URL used by the warmer.
    #[arg(long = "public-base-url", value_name = "URL")]
    pub public_base_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the maximum number of pooled backing-store connections.
    #[arg(long = "store-max-connections", value_name = "COUNT")]
    pub store_max_connections: Option<u64>,

    /// Toggle response caching.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the default response TTL.
    #[arg(long = "cache-default-ttl-ms", value_name = "MILLIS")]
    pub cache_default_ttl_ms: Option<u64>,

    /// Toggle the background cache warmer.
    #[arg(
        long = "warmer-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub warmer_enabled: Option<bool>,

    /// Override the real-time channel path.
    #[arg(long = "realtime-path", value_name = "PATH")]
    pub realtime_path: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WarmArgs {
    /// Override the base URL the warm requests are sent to.
    #[arg(long = "public-base-url", value_name = "URL")]
    pub public_base_url: Option<String>,

    /// Override the bearer token attached to warm requests.
    #[arg(long = "warmer-token", value_name = "TOKEN")]
    pub warmer_token: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StatsArgs {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Pretty-print the JSON output.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub pretty: bool,
}
