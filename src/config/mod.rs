//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{ArgGroup, Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{BackendKind, CachePolicy};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachet";
const ENV_PREFIX: &str = "CACHET";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_NAMESPACE: &str = "views";
const DEFAULT_KEY_PREFIX: &str = "cachet:";
const DEFAULT_MEMORY_CAPACITY: usize = 1024;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
const DEFAULT_PAGE_ROOT: &str = "public/cache";
const DEFAULT_GZIP_MIN_BYTES: usize = 256;
const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_WARM_CONCURRENCY: usize = 4;

/// Command-line arguments for the cachet binary.
#[derive(Debug, Parser)]
#[command(name = "cachet", version, about = "Content cache administration")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CACHET_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve page artifacts and the administrative API.
    Serve(Box<ServeArgs>),
    /// Remove fragments and page artifacts under a prefix.
    Purge(PurgeArgs),
    /// Pre-render pages by requesting them from a running server.
    Warm(WarmArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the fragment store backend (memory|redis).
    #[arg(long = "cache-backend", value_name = "KIND")]
    pub backend: Option<String>,

    /// Override the redis connection URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the page artifact root directory.
    #[arg(long = "page-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub page_root: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the artifact listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the artifact listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

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

    /// Override the base URL warm-up requests are sent to.
    #[arg(long = "warm-base-url", value_name = "URL")]
    pub warm_base_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
#[command(group(
    ArgGroup::new("scope")
        .required(true)
        .multiple(true)
        .args(["fragment_prefix", "path_prefix", "all"])
))]
pub struct PurgeArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Remove fragments whose store key starts with this prefix
    /// (e.g. `views/company/`); empty removes every fragment.
    #[arg(long = "fragment-prefix", value_name = "PREFIX")]
    pub fragment_prefix: Option<String>,

    /// Remove page artifacts whose request path starts with this prefix
    /// (e.g. `/companies/`); empty removes every artifact.
    #[arg(long = "path-prefix", value_name = "PREFIX")]
    pub path_prefix: Option<String>,

    /// Remove everything from both tiers.
    #[arg(long, conflicts_with_all = ["fragment_prefix", "path_prefix"])]
    pub all: bool,
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the base URL warm-up requests are sent to.
    #[arg(long = "base-url", value_name = "URL")]
    pub base_url: Option<String>,

    /// Maximum number of concurrent warm requests.
    #[arg(long, value_name = "COUNT")]
    pub concurrency: Option<usize>,

    /// Request paths to warm; defaults to `warm.paths` from configuration.
    #[arg(value_name = "PATH")]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: FragmentSettings,
    pub page_cache: PageCacheSettings,
    pub http: HttpSettings,
    pub warm: WarmSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
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
pub struct FragmentSettings {
    pub enabled: bool,
    pub namespace: String,
    pub backend: BackendKind,
    pub key_prefix: String,
    pub memory_capacity: NonZeroUsize,
    pub fragment_ttl: Option<Duration>,
    pub store_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PageCacheSettings {
    pub enabled: bool,
    pub root: PathBuf,
    pub gzip: bool,
    pub gzip_min_bytes: usize,
    pub max_body_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub public: bool,
    pub max_age: Duration,
    pub must_revalidate: bool,
}

impl HttpSettings {
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            public: self.public,
            max_age_seconds: self.max_age.as_secs(),
            must_revalidate: self.must_revalidate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarmSettings {
    pub base_url: Option<Url>,
    pub concurrency: NonZeroUsize,
    pub paths: Vec<String>,
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
        Some(Command::Purge(args)) => raw.apply_cache_overrides(&args.cache),
        Some(Command::Warm(args)) => raw.apply_warm_overrides(args),
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
    page_cache: RawPageCacheSettings,
    http: RawHttpSettings,
    warm: RawWarmSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
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
        if let Some(url) = overrides.warm_base_url.as_ref() {
            self.warm.base_url = Some(url.clone());
        }

        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(backend) = overrides.backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(root) = overrides.page_root.as_ref() {
            self.page_cache.root = Some(root.clone());
        }
    }

    fn apply_warm_overrides(&mut self, args: &WarmArgs) {
        self.apply_cache_overrides(&args.cache);
        if let Some(url) = args.base_url.as_ref() {
            self.warm.base_url = Some(url.clone());
        }
        if let Some(concurrency) = args.concurrency {
            self.warm.concurrency = Some(concurrency);
        }
        if !args.paths.is_empty() {
            self.warm.paths = Some(args.paths.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            page_cache,
            http,
            warm,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_fragment_settings(cache)?,
            page_cache: build_page_cache_settings(page_cache)?,
            http: build_http_settings(http),
            warm: build_warm_settings(warm)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
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

fn build_fragment_settings(cache: RawCacheSettings) -> Result<FragmentSettings, LoadError> {
    let namespace = cache
        .namespace
        .map(|value| value.trim().trim_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    if namespace.is_empty() {
        return Err(LoadError::invalid("cache.namespace", "must not be empty"));
    }

    let redis_url = cache.redis_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    let backend = match cache
        .backend
        .as_deref()
        .map(str::trim)
        .unwrap_or("memory")
        .to_ascii_lowercase()
        .as_str()
    {
        "memory" => BackendKind::Memory,
        "redis" => match redis_url {
            Some(url) => BackendKind::Redis { url },
            None => {
                return Err(LoadError::invalid(
                    "cache.redis_url",
                    "required when cache.backend = \"redis\"",
                ));
            }
        },
        other => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}`; expected memory or redis"),
            ));
        }
    };

    let memory_capacity = non_zero_usize(
        cache.memory_capacity.unwrap_or(DEFAULT_MEMORY_CAPACITY),
        "cache.memory_capacity",
    )?;

    let store_timeout_ms = cache.store_timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS);
    if store_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.store_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(FragmentSettings {
        enabled: cache.enabled.unwrap_or(true),
        namespace,
        backend,
        key_prefix: cache
            .key_prefix
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        memory_capacity,
        fragment_ttl: cache
            .fragment_ttl_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
        store_timeout: Duration::from_millis(store_timeout_ms),
    })
}

fn build_page_cache_settings(
    page_cache: RawPageCacheSettings,
) -> Result<PageCacheSettings, LoadError> {
    let root = page_cache
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PAGE_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "page_cache.root",
            "path must not be empty",
        ));
    }

    let max_body_bytes = non_zero_usize(
        page_cache.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
        "page_cache.max_body_bytes",
    )?;

    Ok(PageCacheSettings {
        enabled: page_cache.enabled.unwrap_or(true),
        root,
        gzip: page_cache.gzip.unwrap_or(true),
        gzip_min_bytes: page_cache.gzip_min_bytes.unwrap_or(DEFAULT_GZIP_MIN_BYTES),
        max_body_bytes,
    })
}

fn build_http_settings(http: RawHttpSettings) -> HttpSettings {
    let defaults = CachePolicy::default();
    HttpSettings {
        public: http.public.unwrap_or(defaults.public),
        max_age: Duration::from_secs(http.max_age_seconds.unwrap_or(defaults.max_age_seconds)),
        must_revalidate: http.must_revalidate.unwrap_or(defaults.must_revalidate),
    }
}

fn build_warm_settings(warm: RawWarmSettings) -> Result<WarmSettings, LoadError> {
    let base_url = match warm.base_url.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            Url::parse(raw)
                .map_err(|err| LoadError::invalid("warm.base_url", err.to_string()))?,
        ),
    };

    let concurrency = non_zero_usize(
        warm.concurrency.unwrap_or(DEFAULT_WARM_CONCURRENCY),
        "warm.concurrency",
    )?;

    Ok(WarmSettings {
        base_url,
        concurrency,
        paths: warm.paths.unwrap_or_default(),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
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
    namespace: Option<String>,
    backend: Option<String>,
    redis_url: Option<String>,
    key_prefix: Option<String>,
    memory_capacity: Option<usize>,
    fragment_ttl_seconds: Option<u64>,
    store_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPageCacheSettings {
    enabled: Option<bool>,
    root: Option<PathBuf>,
    gzip: Option<bool>,
    gzip_min_bytes: Option<usize>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHttpSettings {
    public: Option<bool>,
    max_age_seconds: Option<u64>,
    must_revalidate: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmSettings {
    base_url: Option<String>,
    concurrency: Option<usize>,
    paths: Option<Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
