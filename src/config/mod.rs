//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides, SnapshotArgs, StoreOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "fortunecat";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;
const DEFAULT_IMAGE_TTL_MINUTES: u64 = 120;
const DEFAULT_CORPUS_SIZE: u64 = 12_362;
const DEFAULT_NEIGHBOURS: u64 = 3;
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TEXT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_IMAGE_MODEL: &str = "dall-e-3";
const DEFAULT_MAX_TOKENS: u64 = 150;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_STORE_BACKEND: &str = "fs";
const DEFAULT_STORE_CONTAINER: &str = "fortunecat";
const DEFAULT_STORE_DIRECTORY: &str = "data";
const DEFAULT_SNAPSHOT_KEY: &str = "screen.json";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub refresh: RefreshSettings,
    pub openai: OpenAiSettings,
    pub store: StoreSettings,
    pub index: IndexSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
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
pub struct RefreshSettings {
    pub interval: Duration,
    pub image_ttl: time::Duration,
    pub corpus_size: NonZeroU32,
    pub neighbours: NonZeroU32,
}

/// Generator settings. Credentials stay optional here and are checked on first use.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub base_url: Url,
    pub text_model: String,
    pub image_model: String,
    pub max_tokens: NonZeroU32,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Azure,
    Fs,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "azure" => Ok(Self::Azure),
            "fs" => Ok(Self::Fs),
            "memory" => Ok(Self::Memory),
            other => Err(format!(
                "unknown backend `{other}` (expected azure, fs or memory)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub connection_string: Option<String>,
    pub container: String,
    pub snapshot_key: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub api_key: Option<String>,
    pub environment: Option<String>,
    pub name: Option<String>,
    pub namespace: String,
    pub host: Option<Url>,
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

    builder = builder.add_source(
        Environment::with_prefix("FORTUNECAT")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("server.cors_origins")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Snapshot(args)) => raw.apply_store_overrides(&args.store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    refresh: RawRefreshSettings,
    openai: RawOpenAiSettings,
    store: RawStoreSettings,
    index: RawIndexSettings,
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
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(seconds) = overrides.refresh_interval_seconds {
            self.refresh.interval_seconds = Some(seconds);
        }
        if let Some(minutes) = overrides.refresh_image_ttl_minutes {
            self.refresh.image_ttl_minutes = Some(minutes);
        }

        self.apply_store_overrides(&overrides.store);
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(backend) = overrides.store_backend.as_ref() {
            self.store.backend = Some(backend.clone());
        }
        if let Some(directory) = overrides.store_directory.as_ref() {
            self.store.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            refresh,
            openai,
            store,
            index,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let refresh = build_refresh_settings(refresh)?;
        let openai = build_openai_settings(openai)?;
        let store = build_store_settings(store)?;
        let index = build_index_settings(index)?;

        Ok(Self {
            server,
            logging,
            refresh,
            openai,
            store,
            index,
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

    let mut cors_origins = Vec::new();
    for origin in server.cors_origins.unwrap_or_default() {
        let trimmed = origin.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.parse::<axum::http::HeaderValue>().is_err() {
            return Err(LoadError::invalid(
                "server.cors_origins",
                format!("`{trimmed}` is not a valid origin"),
            ));
        }
        cors_origins.push(trimmed.to_string());
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        cors_origins,
    })
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

fn build_refresh_settings(refresh: RawRefreshSettings) -> Result<RefreshSettings, LoadError> {
    let interval_secs = refresh
        .interval_seconds
        .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
    if interval_secs == 0 {
        return Err(LoadError::invalid(
            "refresh.interval_seconds",
            "must be greater than zero",
        ));
    }

    let ttl_minutes = refresh
        .image_ttl_minutes
        .unwrap_or(DEFAULT_IMAGE_TTL_MINUTES);
    let ttl_minutes = i64::try_from(ttl_minutes).map_err(|_| {
        LoadError::invalid("refresh.image_ttl_minutes", "value exceeds supported range")
    })?;

    let corpus_size = non_zero_u32(
        refresh.corpus_size.unwrap_or(DEFAULT_CORPUS_SIZE),
        "refresh.corpus_size",
    )?;
    let neighbours = non_zero_u32(
        refresh.neighbours.unwrap_or(DEFAULT_NEIGHBOURS),
        "refresh.neighbours",
    )?;

    Ok(RefreshSettings {
        interval: Duration::from_secs(interval_secs),
        image_ttl: time::Duration::minutes(ttl_minutes),
        corpus_size,
        neighbours,
    })
}

fn build_openai_settings(openai: RawOpenAiSettings) -> Result<OpenAiSettings, LoadError> {
    let base_url = openai
        .base_url
        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
    let base_url = parse_url(&base_url, "openai.base_url")?;

    let text_model = non_empty(openai.text_model).unwrap_or_else(|| DEFAULT_TEXT_MODEL.into());
    let image_model = non_empty(openai.image_model).unwrap_or_else(|| DEFAULT_IMAGE_MODEL.into());

    let max_tokens = non_zero_u32(
        openai.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "openai.max_tokens",
    )?;

    let timeout_secs = openai
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "openai.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(OpenAiSettings {
        api_key: non_empty(openai.api_key),
        base_url,
        text_model,
        image_model,
        max_tokens,
        request_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let backend = store
        .backend
        .unwrap_or_else(|| DEFAULT_STORE_BACKEND.to_string());
    let backend = StoreBackend::from_str(&backend)
        .map_err(|reason| LoadError::invalid("store.backend", reason))?;

    let container =
        non_empty(store.container).unwrap_or_else(|| DEFAULT_STORE_CONTAINER.to_string());
    let snapshot_key =
        non_empty(store.snapshot_key).unwrap_or_else(|| DEFAULT_SNAPSHOT_KEY.to_string());

    let directory = store
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIRECTORY));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "store.directory",
            "path must not be empty",
        ));
    }

    Ok(StoreSettings {
        backend,
        connection_string: non_empty(store.connection_string),
        container,
        snapshot_key,
        directory,
    })
}

fn build_index_settings(index: RawIndexSettings) -> Result<IndexSettings, LoadError> {
    let host = non_empty(index.host)
        .map(|host| parse_url(&host, "index.host"))
        .transpose()?;

    Ok(IndexSettings {
        api_key: non_empty(index.api_key),
        environment: non_empty(index.environment),
        name: non_empty(index.name),
        namespace: index.namespace.unwrap_or_default(),
        host,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    cors_origins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRefreshSettings {
    interval_seconds: Option<u64>,
    image_ttl_minutes: Option<u64>,
    corpus_size: Option<u64>,
    neighbours: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOpenAiSettings {
    api_key: Option<String>,
    base_url: Option<String>,
    text_model: Option<String>,
    image_model: Option<String>,
    max_tokens: Option<u64>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    backend: Option<String>,
    connection_string: Option<String>,
    container: Option<String>,
    snapshot_key: Option<String>,
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIndexSettings {
    api_key: Option<String>,
    environment: Option<String>,
    name: Option<String>,
    namespace: Option<String>,
    host: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    Url::parse(value.trim()).map_err(|err| LoadError::invalid(key, format!("invalid url: {err}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
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

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
