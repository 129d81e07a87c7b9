//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{
    CliArgs, Command, EngineArg, EngineOverrides, FormatArg, RenderArgs, ServeArgs,
    ServeOverrides, SweepArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mermaid-render";
const ENV_PREFIX: &str = "MERMAID_RENDER";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_MAX_BODY_BYTES: u64 = 1024 * 1024;
const DEFAULT_RENDER_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_DIMENSION: u32 = 10_000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 150;
const DEFAULT_SVG_PADDING: u32 = 8;
const DEFAULT_PDF_PADDING: u32 = 16;
const DEFAULT_MERMAID_SCRIPT: &str = "assets/mermaid.min.js";
const DEFAULT_CLI_PATH: &str = "mmdc";
const DEFAULT_MAX_SESSIONS: usize = 4;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_DRIVER_PATH: &str = "chromedriver";
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 20;
const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 24 * 3600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_REMOTE_PREFIX: &str = "diagrams";
const DEFAULT_EXISTS_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SIGNED_URL_TTL_SECS: u64 = 3600;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub render: RenderSettings,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
    /// `None` when durable delivery is disabled.
    pub remote: Option<RemoteSettings>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub max_body_bytes: usize,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Pooled headless-browser sessions.
    Pool,
    /// One `mmdc` process per render.
    Cli,
}

impl From<EngineArg> for EngineKind {
    fn from(value: EngineArg) -> Self {
        match value {
            EngineArg::Pool => EngineKind::Pool,
            EngineArg::Cli => EngineKind::Cli,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub engine: EngineKind,
    pub timeout: Duration,
    pub max_width: u32,
    pub max_height: u32,
    pub settle_delay: Duration,
    pub svg_padding: u32,
    pub pdf_padding: u32,
    pub mermaid_script: String,
    pub work_dir: PathBuf,
    pub cli_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_sessions: usize,
    pub health_interval: Duration,
    pub idle_timeout: Duration,
    pub driver_path: PathBuf,
    pub browser_binary: Option<PathBuf>,
    pub startup_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub endpoint: Url,
    pub bucket: String,
    pub prefix: String,
    pub public_base_url: String,
    pub internal_base_url: Option<String>,
    pub signing_secret: Option<String>,
    pub access_token: Option<String>,
    pub exists_timeout: Duration,
    pub upload_timeout: Duration,
    pub signed_url_ttl: Duration,
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
        Some(Command::Render(args)) => raw.apply_engine_overrides(&args.engine),
        Some(Command::Sweep(args)) => {
            if let Some(dir) = args.cache_dir.as_ref() {
                raw.cache.directory = Some(dir.clone());
            }
        }
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
    render: RawRenderSettings,
    pool: RawPoolSettings,
    cache: RawCacheSettings,
    remote: RawRemoteSettings,
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

        self.apply_engine_overrides(&overrides.engine);
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(engine) = overrides.engine {
            self.render.engine = Some(engine.into());
        }
        if let Some(max) = overrides.max_sessions {
            self.pool.max_sessions = Some(max);
        }
        if let Some(dir) = overrides.cache_dir.as_ref() {
            self.cache.directory = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            render,
            pool,
            cache,
            remote,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            render: build_render_settings(render)?,
            pool: build_pool_settings(pool)?,
            cache: build_cache_settings(cache)?,
            remote: build_remote_settings(remote)?,
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

    let graceful_shutdown = positive_secs(
        server.graceful_shutdown_seconds,
        DEFAULT_GRACEFUL_SHUTDOWN_SECS,
        "server.graceful_shutdown_seconds",
    )?;

    let max_body_bytes_value = server.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES);
    if max_body_bytes_value == 0 {
        return Err(LoadError::invalid(
            "server.max_body_bytes",
            "must be greater than zero",
        ));
    }
    let max_body_bytes = usize::try_from(max_body_bytes_value).map_err(|_| {
        LoadError::invalid(
            "server.max_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
        max_body_bytes,
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

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let timeout_ms = render.timeout_ms.unwrap_or(DEFAULT_RENDER_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "render.timeout_ms",
            "must be greater than zero",
        ));
    }

    let max_width = render.max_width.unwrap_or(DEFAULT_MAX_DIMENSION);
    if max_width == 0 {
        return Err(LoadError::invalid("render.max_width", "must be greater than zero"));
    }
    let max_height = render.max_height.unwrap_or(DEFAULT_MAX_DIMENSION);
    if max_height == 0 {
        return Err(LoadError::invalid("render.max_height", "must be greater than zero"));
    }

    let mermaid_script = render
        .mermaid_script
        .unwrap_or_else(|| DEFAULT_MERMAID_SCRIPT.to_string());
    if mermaid_script.trim().is_empty() {
        return Err(LoadError::invalid(
            "render.mermaid_script",
            "location must not be empty",
        ));
    }

    let cli_path = render
        .cli_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CLI_PATH));
    if cli_path.as_os_str().is_empty() {
        return Err(LoadError::invalid("render.cli_path", "path must not be empty"));
    }

    let work_dir = non_empty_dir(
        render.work_dir,
        || std::env::temp_dir().join("mermaid-render"),
        "render.work_dir",
    )?;

    Ok(RenderSettings {
        engine: render.engine.unwrap_or(EngineKind::Pool),
        timeout: Duration::from_millis(timeout_ms),
        max_width,
        max_height,
        settle_delay: Duration::from_millis(
            render.settle_delay_ms.unwrap_or(DEFAULT_SETTLE_DELAY_MS),
        ),
        svg_padding: render.svg_padding.unwrap_or(DEFAULT_SVG_PADDING),
        pdf_padding: render.pdf_padding.unwrap_or(DEFAULT_PDF_PADDING),
        mermaid_script,
        work_dir,
        cli_path,
    })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let max_sessions = pool.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS);
    if max_sessions == 0 {
        return Err(LoadError::invalid(
            "pool.max_sessions",
            "must be greater than zero",
        ));
    }

    let driver_path = pool
        .driver_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DRIVER_PATH));
    if driver_path.as_os_str().is_empty() {
        return Err(LoadError::invalid("pool.driver_path", "path must not be empty"));
    }

    Ok(PoolSettings {
        max_sessions,
        health_interval: positive_secs(
            pool.health_interval_seconds,
            DEFAULT_HEALTH_INTERVAL_SECS,
            "pool.health_interval_seconds",
        )?,
        idle_timeout: positive_secs(
            pool.idle_timeout_seconds,
            DEFAULT_IDLE_TIMEOUT_SECS,
            "pool.idle_timeout_seconds",
        )?,
        driver_path,
        browser_binary: pool.browser_binary.filter(|path| !path.as_os_str().is_empty()),
        startup_timeout: positive_secs(
            pool.startup_timeout_seconds,
            DEFAULT_STARTUP_TIMEOUT_SECS,
            "pool.startup_timeout_seconds",
        )?,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        directory: non_empty_dir(
            cache.directory,
            || std::env::temp_dir().join("mermaid-render-cache"),
            "cache.directory",
        )?,
        max_age: positive_secs(
            cache.max_age_seconds,
            DEFAULT_CACHE_MAX_AGE_SECS,
            "cache.max_age_seconds",
        )?,
        sweep_interval: positive_secs(
            cache.sweep_interval_seconds,
            DEFAULT_SWEEP_INTERVAL_SECS,
            "cache.sweep_interval_seconds",
        )?,
    })
}

fn build_remote_settings(remote: RawRemoteSettings) -> Result<Option<RemoteSettings>, LoadError> {
    if !remote.enabled.unwrap_or(false) {
        return Ok(None);
    }

    let endpoint = required(remote.endpoint, "remote.endpoint")?;
    let endpoint = Url::parse(&endpoint)
        .map_err(|err| LoadError::invalid("remote.endpoint", format!("invalid URL: {err}")))?;
    let bucket = required(remote.bucket, "remote.bucket")?;
    let public_base_url = required(remote.public_base_url, "remote.public_base_url")?;

    let prefix = remote
        .prefix
        .map(|prefix| prefix.trim_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_REMOTE_PREFIX.to_string());

    let signed_url_ttl_secs = remote
        .signed_url_ttl_seconds
        .unwrap_or(DEFAULT_SIGNED_URL_TTL_SECS);
    if signed_url_ttl_secs == 0 {
        return Err(LoadError::invalid(
            "remote.signed_url_ttl_seconds",
            "must be greater than zero",
        ));
    }

    Ok(Some(RemoteSettings {
        endpoint,
        bucket,
        prefix,
        public_base_url,
        internal_base_url: optional(remote.internal_base_url),
        signing_secret: optional(remote.signing_secret),
        access_token: optional(remote.access_token),
        exists_timeout: positive_millis(
            remote.exists_timeout_ms,
            DEFAULT_EXISTS_TIMEOUT_MS,
            "remote.exists_timeout_ms",
        )?,
        upload_timeout: positive_millis(
            remote.upload_timeout_ms,
            DEFAULT_UPLOAD_TIMEOUT_MS,
            "remote.upload_timeout_ms",
        )?,
        signed_url_ttl: Duration::from_secs(signed_url_ttl_secs),
    }))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    engine: Option<EngineKind>,
    timeout_ms: Option<u64>,
    max_width: Option<u32>,
    max_height: Option<u32>,
    settle_delay_ms: Option<u64>,
    svg_padding: Option<u32>,
    pdf_padding: Option<u32>,
    mermaid_script: Option<String>,
    work_dir: Option<PathBuf>,
    cli_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    max_sessions: Option<usize>,
    health_interval_seconds: Option<u64>,
    idle_timeout_seconds: Option<u64>,
    driver_path: Option<PathBuf>,
    browser_binary: Option<PathBuf>,
    startup_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
    max_age_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRemoteSettings {
    enabled: Option<bool>,
    endpoint: Option<String>,
    bucket: Option<String>,
    prefix: Option<String>,
    public_base_url: Option<String>,
    internal_base_url: Option<String>,
    signing_secret: Option<String>,
    access_token: Option<String>,
    exists_timeout_ms: Option<u64>,
    upload_timeout_ms: Option<u64>,
    signed_url_ttl_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive_secs(
    value: Option<u64>,
    default: u64,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn positive_millis(
    value: Option<u64>,
    default: u64,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        millis => Ok(Duration::from_millis(millis)),
    }
}

fn non_empty_dir(
    value: Option<PathBuf>,
    default: impl FnOnce() -> PathBuf,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let dir = value.unwrap_or_else(default);
    if dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(dir)
}

fn optional(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn required(value: Option<String>, key: &'static str) -> Result<String, LoadError> {
    optional(value).ok_or_else(|| LoadError::invalid(key, "required when remote is enabled"))
}
