//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheTier, Entity, Operation, StrategyResolverBuilder};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "vitrine";
const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_GC_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_ROTATION_INTERVAL_MS: u64 = 8000;
const DEFAULT_ROTATE_ROUNDS: usize = 5;

/// Command-line arguments for the Vitrine binary.
#[derive(Debug, Parser)]
#[command(
    name = "vitrine",
    version,
    about = "Marketplace query cache and sponsored rotation toolkit"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VITRINE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the cache tier table.
    Tiers,
    /// Resolve the cache strategy for an entity operation.
    Strategy(StrategyArgs),
    /// Rotate sponsored promotions from a TOML catalogue.
    Rotate(RotateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the cache entry limit.
    #[arg(long = "cache-max-entries", value_name = "COUNT", global = true)]
    pub cache_max_entries: Option<usize>,

    /// Override the delay between retries of transient failures.
    #[arg(long = "cache-retry-delay-ms", value_name = "MS", global = true)]
    pub cache_retry_delay_ms: Option<u64>,

    /// Override the garbage collection sweep interval.
    #[arg(long = "cache-gc-sweep-interval-ms", value_name = "MS", global = true)]
    pub cache_gc_sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct StrategyArgs {
    /// Entity name, e.g. `services`.
    #[arg(long, value_name = "ENTITY")]
    pub entity: String,

    /// Operation: list, detail, user, search, stats, realtime or a custom name.
    #[arg(long, value_name = "OPERATION", default_value = "list")]
    pub operation: String,

    /// Rendering context, e.g. `homepage`.
    #[arg(long, value_name = "CONTEXT")]
    pub context: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct RotateArgs {
    /// Catalogue of promotions to seed the in-memory store with.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub catalog: PathBuf,

    /// Number of selections to print.
    #[arg(long, default_value_t = DEFAULT_ROTATE_ROUNDS)]
    pub rounds: usize,

    /// Seed for reproducible draws; OS entropy when absent.
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,

    /// Override the rotation interval.
    #[arg(long = "interval-ms", value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Never draw the same promotion twice in a row.
    #[arg(long = "exclude-previous", action = clap::ArgAction::SetTrue)]
    pub exclude_previous: bool,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub rotation: RotationSettings,
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
    pub max_entries: usize,
    pub retry_delay_ms: u64,
    pub gc_sweep_interval_ms: u64,
    pub overrides: Vec<StrategyOverride>,
}

impl CacheSettings {
    /// Layer the configured tier overrides on top of `builder`.
    pub fn apply_overrides(&self, builder: StrategyResolverBuilder) -> StrategyResolverBuilder {
        self.overrides
            .iter()
            .fold(builder, |builder, entry| match entry.context.as_deref() {
                Some(context) => builder.context_override(
                    entry.entity.clone(),
                    entry.operation.clone(),
                    context,
                    entry.tier.strategy(),
                ),
                None => builder.entity_override(
                    entry.entity.clone(),
                    entry.operation.clone(),
                    entry.tier.strategy(),
                ),
            })
    }
}

/// One `[[cache.overrides]]` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOverride {
    pub entity: Entity,
    pub operation: Operation,
    pub context: Option<String>,
    pub tier: CacheTier,
}

#[derive(Debug, Clone)]
pub struct RotationSettings {
    pub interval: Duration,
    pub exclude_previous: bool,
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

    builder = builder.add_source(Environment::with_prefix("VITRINE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    if let Some(Command::Rotate(args)) = cli.command.as_ref() {
        raw.apply_rotate_overrides(args);
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    rotation: RawRotationSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max);
        }
        if let Some(delay) = overrides.cache_retry_delay_ms {
            self.cache.retry_delay_ms = Some(delay);
        }
        if let Some(interval) = overrides.cache_gc_sweep_interval_ms {
            self.cache.gc_sweep_interval_ms = Some(interval);
        }
    }

    fn apply_rotate_overrides(&mut self, args: &RotateArgs) {
        if let Some(interval) = args.interval_ms {
            self.rotation.interval_ms = Some(interval);
        }
        if args.exclude_previous {
            self.rotation.exclude_previous = Some(true);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            rotation,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            rotation: build_rotation_settings(rotation)?,
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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_entries = cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
    if max_entries == 0 {
        return Err(LoadError::invalid(
            "cache.max_entries",
            "must be greater than zero",
        ));
    }

    let gc_sweep_interval_ms = cache
        .gc_sweep_interval_ms
        .unwrap_or(DEFAULT_GC_SWEEP_INTERVAL_MS);
    if gc_sweep_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.gc_sweep_interval_ms",
            "must be greater than zero",
        ));
    }

    let overrides = cache
        .overrides
        .into_iter()
        .map(build_strategy_override)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CacheSettings {
        max_entries,
        retry_delay_ms: cache.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
        gc_sweep_interval_ms,
        overrides,
    })
}

fn build_strategy_override(raw: RawStrategyOverride) -> Result<StrategyOverride, LoadError> {
    let entity = raw.entity.trim();
    if entity.is_empty() {
        return Err(LoadError::invalid(
            "cache.overrides.entity",
            "must not be empty",
        ));
    }
    let tier = CacheTier::from_str(&raw.tier)
        .map_err(|err| LoadError::invalid("cache.overrides.tier", err.to_string()))?;
    let Ok(operation) = Operation::from_str(raw.operation.trim());
    let context = raw.context.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(StrategyOverride {
        entity: Entity::new(entity),
        operation,
        context,
        tier,
    })
}

fn build_rotation_settings(rotation: RawRotationSettings) -> Result<RotationSettings, LoadError> {
    let interval_ms = rotation.interval_ms.unwrap_or(DEFAULT_ROTATION_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "rotation.interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(RotationSettings {
        interval: Duration::from_millis(interval_ms),
        exclude_previous: rotation.exclude_previous.unwrap_or(false),
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
struct RawCacheSettings {
    max_entries: Option<usize>,
    retry_delay_ms: Option<u64>,
    gc_sweep_interval_ms: Option<u64>,
    overrides: Vec<RawStrategyOverride>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawStrategyOverride {
    entity: String,
    operation: String,
    context: Option<String>,
    tier: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRotationSettings {
    interval_ms: Option<u64>,
    exclude_previous: Option<bool>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
