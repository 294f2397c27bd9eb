//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU64, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::registry::EntityKind;
use crate::cache::CacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "sitecms";
const DEFAULT_STORE_SCHEMA: &str = "public";
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// Command-line arguments for the sitecms binary.
#[derive(Debug, Parser)]
#[command(name = "sitecms", version, about = "Cached content access for the site tables")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "SITECMS_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List records through the entity service's baseline view.
    Read(ReadArgs),
    /// Fetch one record by id.
    Get(GetArgs),
    /// Print aggregate counts for an entity.
    Stats(StatsArgs),
}

impl Command {
    fn overrides(&self) -> &Overrides {
        match self {
            Command::Read(args) => &args.overrides,
            Command::Get(args) => &args.overrides,
            Command::Stats(args) => &args.overrides,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct ReadArgs {
    #[arg(value_enum)]
    pub entity: EntityKind,

    /// Page size; together with --offset this reads one window.
    #[arg(long, value_name = "COUNT")]
    pub limit: Option<usize>,

    /// Rows to skip before the page starts.
    #[arg(long, value_name = "COUNT")]
    pub offset: Option<usize>,

    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    #[arg(value_enum)]
    pub entity: EntityKind,

    pub id: String,

    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Clone)]
pub struct StatsArgs {
    #[arg(value_enum)]
    pub entity: EntityKind,

    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
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

    /// Override the PostgREST endpoint URL.
    #[arg(long = "store-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub store_url: Option<String>,

    /// Disable every entity cache for this run.
    #[arg(long = "no-cache", action = clap::ArgAction::SetTrue)]
    pub no_cache: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// PostgREST root, e.g. `https://project.example/rest/v1`.
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub schema: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub articles_ttl_ms: NonZeroU64,
    pub social_posts_ttl_ms: NonZeroU64,
    pub lesson_status_ttl_ms: NonZeroU64,
    pub admin_ttl_ms: NonZeroU64,
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

    builder = builder.add_source(Environment::with_prefix("SITECMS").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(cli.command.overrides());

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
        if overrides.no_cache {
            self.cache.enabled = Some(false);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            store,
            cache,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store)?,
            cache: build_cache_settings(cache)?,
        })
    }
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

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = non_blank(store.url);
    if let Some(url) = url.as_deref() {
        let parsed = url::Url::parse(url)
            .map_err(|err| LoadError::invalid("store.url", format!("failed to parse: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(LoadError::invalid("store.url", "scheme must be http or https"));
        }
    }

    let schema = non_blank(store.schema).unwrap_or_else(|| DEFAULT_STORE_SCHEMA.to_string());

    let timeout_secs = store
        .timeout_seconds
        .unwrap_or(DEFAULT_STORE_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "store.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(StoreSettings {
        url,
        api_key: non_blank(store.api_key),
        schema,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        articles_ttl_ms: non_zero_ttl(
            cache.articles_ttl_ms.unwrap_or(defaults.articles_ttl_ms),
            "cache.articles_ttl_ms",
        )?,
        social_posts_ttl_ms: non_zero_ttl(
            cache
                .social_posts_ttl_ms
                .unwrap_or(defaults.social_posts_ttl_ms),
            "cache.social_posts_ttl_ms",
        )?,
        lesson_status_ttl_ms: non_zero_ttl(
            cache
                .lesson_status_ttl_ms
                .unwrap_or(defaults.lesson_status_ttl_ms),
            "cache.lesson_status_ttl_ms",
        )?,
        admin_ttl_ms: non_zero_ttl(
            cache.admin_ttl_ms.unwrap_or(defaults.admin_ttl_ms),
            "cache.admin_ttl_ms",
        )?,
    })
}

fn non_zero_ttl(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
    api_key: Option<String>,
    schema: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    articles_ttl_ms: Option<u64>,
    social_posts_ttl_ms: Option<u64>,
    lesson_status_ttl_ms: Option<u64>,
    admin_ttl_ms: Option<u64>,
}
