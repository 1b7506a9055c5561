//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::WarmEndpoint;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides, StatsArgs, StoreOverride, WarmArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "shelfcache";
const ENV_PREFIX: &str = "SHELFCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_TTL_MS: u64 = 15 * 60 * 1000;
const DEFAULT_TAG_TTL_FLOOR_MS: u64 = 60 * 60 * 1000;
const DEFAULT_CACHE_MAX_KEYS: u64 = 10_000;
const DEFAULT_KEY_PREFIX: &str = "shelfcache:";
const DEFAULT_SCAN_PAGE_SIZE: u64 = 100;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 500;
const DEFAULT_MAX_BODY_BYTES: u64 = 2 * 1024 * 1024;
const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_STORE_MIN_CONNECTIONS: u64 = 1;
const DEFAULT_STORE_MAX_CONNECTIONS: u64 = 10;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HEALTH_PROBE_SECS: u64 = 10;
const DEFAULT_WARM_INITIAL_DELAY_SECS: u64 = 5;
const DEFAULT_WARM_INTERVAL_SECS: u64 = 600;
const DEFAULT_WARM_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WARM_CONCURRENCY: u64 = 4;
const DEFAULT_REALTIME_PATH: &str = "/ws";
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_MEMO_TTL_MS: u64 = 5_000;
const DEFAULT_SEND_BUFFER: u64 = 64;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub warmer: WarmerSettings,
    pub realtime: RealtimeSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    /// Base URL the service is reachable at; warm requests are sent here.
    pub public_base_url: Url,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_ttl_ms: u64,
    pub tag_ttl_floor_ms: u64,
    pub max_keys: NonZeroUsize,
    pub key_prefix: String,
    pub scan_page_size: NonZeroUsize,
    pub operation_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub bypass_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: String,
    pub min_connections: usize,
    pub max_connections: NonZeroUsize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_seconds: u64,
    pub validate_on_borrow: bool,
    pub health_probe_seconds: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct WarmerSettings {
    pub enabled: bool,
    pub initial_delay_seconds: u64,
    pub interval_seconds: NonZeroU32,
    pub request_timeout_ms: u64,
    pub concurrency: NonZeroUsize,
    pub token: Option<String>,
    pub endpoints: Vec<WarmEndpoint>,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub path: String,
    pub heartbeat_seconds: NonZeroU32,
    pub memo_ttl_ms: u64,
    pub send_buffer: NonZeroUsize,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub tokens: Vec<TokenEntry>,
}

/// A bearer token and the subject it authenticates as.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenEntry {
    pub subject: String,
    pub token: String,
}

impl std::fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEntry")
            .field("subject", &self.subject)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Warm(args)) => raw.apply_warm_overrides(args),
        Some(Command::Stats(args)) => raw.apply_store_override(&args.store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    store: RawStoreSettings,
    warmer: RawWarmerSettings,
    realtime: RawRealtimeSettings,
    auth: RawAuthSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(url) = overrides.public_base_url.as_ref() {
            self.server.public_base_url = Some(url.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max) = overrides.store_max_connections {
            self.store.max_connections = Some(max);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(ttl) = overrides.cache_default_ttl_ms {
            self.cache.default_ttl_ms = Some(ttl);
        }
        if let Some(enabled) = overrides.warmer_enabled {
            self.warmer.enabled = Some(enabled);
        }
        if let Some(path) = overrides.realtime_path.as_ref() {
            self.realtime.path = Some(path.clone());
        }

        self.apply_store_override(&overrides.store);
    }

    fn apply_warm_overrides(&mut self, args: &WarmArgs) {
        if let Some(url) = args.public_base_url.as_ref() {
            self.server.public_base_url = Some(url.clone());
        }
        if let Some(token) = args.warmer_token.as_ref() {
            self.warmer.token = Some(token.clone());
        }
    }

    fn apply_store_override(&mut self, overrides: &StoreOverride) {
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            store,
            warmer,
            realtime,
            auth,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let store = build_store_settings(store)?;
        let warmer = build_warmer_settings(warmer)?;
        let realtime = build_realtime_settings(realtime)?;
        let auth = build_auth_settings(auth)?;

        Ok(Self {
            server,
            logging,
            cache,
            store,
            warmer,
            realtime,
            auth,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let public_base_url = match non_empty(server.public_base_url) {
        Some(raw) => {
            let url = Url::parse(&raw).map_err(|err| {
                LoadError::invalid("server.public_base_url", format!("failed to parse: {err}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "server.public_base_url",
                    "scheme must be http or https",
                ));
            }
            url
        }
        None => default_base_url(addr)?,
    };

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        public_base_url,
    })
}

/// Loopback URL for the listener when no public base URL is configured.
fn default_base_url(addr: SocketAddr) -> Result<Url, LoadError> {
    let host = if addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else if addr.is_ipv6() {
        format!("[{}]", addr.ip())
    } else {
        addr.ip().to_string()
    };
    let candidate = format!("http://{host}:{}/", addr.port());
    Url::parse(&candidate)
        .map_err(|err| LoadError::invalid("server.public_base_url", format!("{candidate}: {err}")))
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_ttl_ms = cache.default_ttl_ms.unwrap_or(DEFAULT_CACHE_TTL_MS);
    if default_ttl_ms == 0 {
        return Err(LoadError::invalid(
            "cache.default_ttl_ms",
            "must be greater than zero",
        ));
    }

    let operation_timeout_ms = cache
        .operation_timeout_ms
        .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS);
    if operation_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.operation_timeout_ms",
            "must be greater than zero",
        ));
    }

    let key_prefix = cache
        .key_prefix
        .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
    if key_prefix.contains(['*', '?', '[', ']']) {
        return Err(LoadError::invalid(
            "cache.key_prefix",
            "must not contain glob metacharacters",
        ));
    }

    let max_body_bytes = usize_value(
        cache.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
        "cache.max_body_bytes",
    )?;

    let bypass_paths = cache
        .bypass_paths
        .map(StringList::into_vec)
        .unwrap_or_default();
    if let Some(path) = bypass_paths.iter().find(|path| !path.starts_with('/')) {
        return Err(LoadError::invalid(
            "cache.bypass_paths",
            format!("`{path}` must start with `/`"),
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        default_ttl_ms,
        tag_ttl_floor_ms: cache.tag_ttl_floor_ms.unwrap_or(DEFAULT_TAG_TTL_FLOOR_MS),
        max_keys: non_zero_usize(
            cache.max_keys.unwrap_or(DEFAULT_CACHE_MAX_KEYS),
            "cache.max_keys",
        )?,
        key_prefix,
        scan_page_size: non_zero_usize(
            cache.scan_page_size.unwrap_or(DEFAULT_SCAN_PAGE_SIZE),
            "cache.scan_page_size",
        )?,
        operation_timeout_ms,
        max_body_bytes,
        bypass_paths,
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = non_empty(store.url).unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
    let parsed = Url::parse(&url)
        .map_err(|err| LoadError::invalid("store.url", format!("failed to parse: {err}")))?;
    if !matches!(parsed.scheme(), "redis" | "rediss" | "memory") {
        return Err(LoadError::invalid(
            "store.url",
            format!("unsupported scheme `{}`", parsed.scheme()),
        ));
    }

    let max_connections = non_zero_usize(
        store
            .max_connections
            .unwrap_or(DEFAULT_STORE_MAX_CONNECTIONS),
        "store.max_connections",
    )?;
    let min_connections = usize_value(
        store
            .min_connections
            .unwrap_or(DEFAULT_STORE_MIN_CONNECTIONS),
        "store.min_connections",
    )?;
    if min_connections > max_connections.get() {
        return Err(LoadError::invalid(
            "store.min_connections",
            "must not exceed store.max_connections",
        ));
    }

    let acquire_timeout_ms = store
        .acquire_timeout_ms
        .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_MS);
    if acquire_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "store.acquire_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(StoreSettings {
        url,
        min_connections,
        max_connections,
        acquire_timeout_ms,
        idle_timeout_seconds: store
            .idle_timeout_seconds
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
        validate_on_borrow: store.validate_on_borrow.unwrap_or(true),
        health_probe_seconds: non_zero_u32(
            store
                .health_probe_seconds
                .unwrap_or(DEFAULT_HEALTH_PROBE_SECS),
            "store.health_probe_seconds",
        )?,
    })
}

fn build_warmer_settings(warmer: RawWarmerSettings) -> Result<WarmerSettings, LoadError> {
    let request_timeout_ms = warmer
        .request_timeout_ms
        .unwrap_or(DEFAULT_WARM_REQUEST_TIMEOUT_MS);
    if request_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "warmer.request_timeout_ms",
            "must be greater than zero",
        ));
    }

    let endpoints = warmer.endpoints.unwrap_or_default();
    if let Some(endpoint) = endpoints.iter().find(|e| !e.path.starts_with('/')) {
        return Err(LoadError::invalid(
            "warmer.endpoints",
            format!("`{}` must start with `/`", endpoint.path),
        ));
    }

    Ok(WarmerSettings {
        enabled: warmer.enabled.unwrap_or(false),
        initial_delay_seconds: warmer
            .initial_delay_seconds
            .unwrap_or(DEFAULT_WARM_INITIAL_DELAY_SECS),
        interval_seconds: non_zero_u32(
            warmer.interval_seconds.unwrap_or(DEFAULT_WARM_INTERVAL_SECS),
            "warmer.interval_seconds",
        )?,
        request_timeout_ms,
        concurrency: non_zero_usize(
            warmer.concurrency.unwrap_or(DEFAULT_WARM_CONCURRENCY),
            "warmer.concurrency",
        )?,
        token: non_empty(warmer.token),
        endpoints,
    })
}

fn build_realtime_settings(realtime: RawRealtimeSettings) -> Result<RealtimeSettings, LoadError> {
    let path = realtime
        .path
        .unwrap_or_else(|| DEFAULT_REALTIME_PATH.to_string());
    if !path.starts_with('/') || path.len() < 2 {
        return Err(LoadError::invalid(
            "realtime.path",
            "must start with `/` and name a route",
        ));
    }

    Ok(RealtimeSettings {
        path,
        heartbeat_seconds: non_zero_u32(
            realtime.heartbeat_seconds.unwrap_or(DEFAULT_HEARTBEAT_SECS),
            "realtime.heartbeat_seconds",
        )?,
        memo_ttl_ms: realtime.memo_ttl_ms.unwrap_or(DEFAULT_MEMO_TTL_MS),
        send_buffer: non_zero_usize(
            realtime.send_buffer.unwrap_or(DEFAULT_SEND_BUFFER),
            "realtime.send_buffer",
        )?,
    })
}

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings, LoadError> {
    let tokens = auth
        .tokens
        .map(StringList::into_vec)
        .unwrap_or_default()
        .into_iter()
        .map(|entry| parse_token_entry(&entry))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AuthSettings { tokens })
}

fn parse_token_entry(entry: &str) -> Result<TokenEntry, LoadError> {
    let Some((subject, token)) = entry.split_once('=') else {
        return Err(LoadError::invalid(
            "auth.tokens",
            "entries must have the form `subject=token`",
        ));
    };
    let (subject, token) = (subject.trim(), token.trim());
    if subject.is_empty() || token.is_empty() {
        return Err(LoadError::invalid(
            "auth.tokens",
            "subject and token must not be empty",
        ));
    }
    Ok(TokenEntry {
        subject: subject.to_string(),
        token: token.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    public_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    default_ttl_ms: Option<u64>,
    tag_ttl_floor_ms: Option<u64>,
    max_keys: Option<u64>,
    key_prefix: Option<String>,
    scan_page_size: Option<u64>,
    operation_timeout_ms: Option<u64>,
    max_body_bytes: Option<u64>,
    bypass_paths: Option<StringList>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
    min_connections: Option<u64>,
    max_connections: Option<u64>,
    acquire_timeout_ms: Option<u64>,
    idle_timeout_seconds: Option<u64>,
    validate_on_borrow: Option<bool>,
    health_probe_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmerSettings {
    enabled: Option<bool>,
    initial_delay_seconds: Option<u64>,
    interval_seconds: Option<u64>,
    request_timeout_ms: Option<u64>,
    concurrency: Option<u64>,
    token: Option<String>,
    endpoints: Option<Vec<WarmEndpoint>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRealtimeSettings {
    path: Option<String>,
    heartbeat_seconds: Option<u64>,
    memo_ttl_ms: Option<u64>,
    send_buffer: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    tokens: Option<StringList>,
}

/// A list given either as an array (files) or a comma-separated string (environment).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StringList {
    Many(Vec<String>),
    Joined(String),
}

impl StringList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::Many(items) => items,
            Self::Joined(joined) => joined
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(usize_value(value, key)?)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn usize_value(value: u64, key: &'static str) -> Result<usize, LoadError> {
    usize::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))
}
