use super::serde_helpers::{
    load_env_bool, load_env_path_opt, load_env_string, load_env_string_opt, load_env_var,
};
use super::{ConfigError, LogLevel};
use crate::buffer::ChannelConfig;
use crate::reliability::DiskConfig;
use crate::sender::SenderConfig;
use clap::builder::BoolishValueParser;
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2.1/track";
const SEVEN_DAYS_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Instrumentation key identifying the telemetry resource
    #[arg(long, env = "INSTRUMENTATION_KEY", default_value = "")]
    pub instrumentation_key: String,

    /// Ingestion endpoint URL
    #[arg(long, env = "INGESTION_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Number of envelopes per batch
    #[arg(long, env = "BATCH_SIZE", default_value = "250")]
    pub batch_size: usize,

    /// Maximum time an envelope waits in the buffer, in milliseconds
    #[arg(long, env = "BATCH_INTERVAL_MS", default_value = "15000")]
    pub batch_interval_ms: u64,

    /// Persist undeliverable batches to disk and resend them later
    #[arg(long, env = "DISK_RETRY_ENABLED", value_parser = BoolishValueParser::new())]
    pub disk_retry_enabled: bool,

    /// Delay before resending a persisted batch, in milliseconds
    #[arg(long, env = "DISK_RETRY_INTERVAL_MS", default_value = "60000")]
    pub disk_retry_interval_ms: u64,

    /// Upper bound on bytes kept in the overflow directory
    #[arg(long, env = "MAX_BYTES_ON_DISK", default_value = "50000000")]
    pub max_bytes_on_disk: u64,

    /// Persisted batches older than this are deleted, in milliseconds
    #[arg(long, env = "FILE_RETENTION_PERIOD_MS", default_value = "604800000")]
    pub file_retention_period_ms: u64,

    /// Base directory for the overflow store (defaults to the OS temp dir)
    #[arg(long, env = "TELEMETRY_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Connection timeout in seconds
    #[arg(long, env = "CONNECTION_TIMEOUT_SECS", default_value = "10")]
    pub connection_timeout_secs: u64,

    /// Consecutive redirects after which a batch is abandoned
    #[arg(long, env = "MAX_REDIRECTS", default_value = "10")]
    pub max_redirects: u32,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Configuration file path (optional)
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Static bearer token attached to every request
    #[arg(long, env = "BEARER_TOKEN", hide_env_values = true)]
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,

    /// Drop all telemetry instead of sending it
    #[arg(long, env = "TELEMETRY_DISABLED", value_parser = BoolishValueParser::new())]
    pub disabled: bool,

    /// Derived groups (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub channel: ChannelConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub sender: SenderConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub disk: DiskConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instrumentation_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            batch_size: 250,
            batch_interval_ms: 15_000,
            disk_retry_enabled: false,
            disk_retry_interval_ms: 60_000,
            max_bytes_on_disk: 50_000_000,
            file_retention_period_ms: SEVEN_DAYS_MS,
            temp_dir: None,
            request_timeout_secs: 30,
            connection_timeout_secs: 10,
            max_redirects: 10,
            log_level: LogLevel::Info,
            config_file: None,
            bearer_token: None,
            disabled: false,
            channel: ChannelConfig::default(),
            sender: SenderConfig::default(),
            disk: DiskConfig::default(),
        }
    }
}

impl Config {
    /// Parse CLI flags (falling back to environment variables per flag).
    /// With `--config-file` the file supplies the base values and every flag
    /// or variable that was actually given overrides it.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Config::command()
            .try_get_matches_from(args)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        let parsed = Config::from_arg_matches(&matches)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        let Some(path) = parsed.config_file.clone() else {
            return parsed.finish();
        };
        let mut config = Self::parse_file(&path)?;
        config.config_file = Some(path);
        config.overlay_explicit(parsed, &matches);
        config.finish()
    }

    fn overlay_explicit(&mut self, args: Config, matches: &ArgMatches) {
        let given = |id: &str| {
            matches!(
                matches.value_source(id),
                Some(ValueSource::CommandLine | ValueSource::EnvVariable)
            )
        };

        if given("instrumentation_key") {
            self.instrumentation_key = args.instrumentation_key;
        }
        if given("endpoint") {
            self.endpoint = args.endpoint;
        }
        if given("batch_size") {
            self.batch_size = args.batch_size;
        }
        if given("batch_interval_ms") {
            self.batch_interval_ms = args.batch_interval_ms;
        }
        if given("disk_retry_enabled") {
            self.disk_retry_enabled = args.disk_retry_enabled;
        }
        if given("disk_retry_interval_ms") {
            self.disk_retry_interval_ms = args.disk_retry_interval_ms;
        }
        if given("max_bytes_on_disk") {
            self.max_bytes_on_disk = args.max_bytes_on_disk;
        }
        if given("file_retention_period_ms") {
            self.file_retention_period_ms = args.file_retention_period_ms;
        }
        if given("temp_dir") {
            self.temp_dir = args.temp_dir;
        }
        if given("request_timeout_secs") {
            self.request_timeout_secs = args.request_timeout_secs;
        }
        if given("connection_timeout_secs") {
            self.connection_timeout_secs = args.connection_timeout_secs;
        }
        if given("max_redirects") {
            self.max_redirects = args.max_redirects;
        }
        if given("log_level") {
            self.log_level = args.log_level;
        }
        if given("bearer_token") {
            self.bearer_token = args.bearer_token;
        }
        if given("disabled") {
            self.disabled = args.disabled;
        }
    }

    /// Environment only. `CONFIG_FILE`, when set, supplies the base values
    /// and individual variables override it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CONFIG_FILE") {
            Ok(path) => {
                let mut config = Self::parse_file(Path::new(&path))?;
                config.config_file = Some(PathBuf::from(path));
                config
            }
            Err(_) => Config::default(),
        };

        load_env_string("INSTRUMENTATION_KEY", &mut config.instrumentation_key);
        load_env_string("INGESTION_ENDPOINT", &mut config.endpoint);
        load_env_var("BATCH_SIZE", &mut config.batch_size)?;
        load_env_var("BATCH_INTERVAL_MS", &mut config.batch_interval_ms)?;
        load_env_bool("DISK_RETRY_ENABLED", &mut config.disk_retry_enabled)?;
        load_env_var("DISK_RETRY_INTERVAL_MS", &mut config.disk_retry_interval_ms)?;
        load_env_var("MAX_BYTES_ON_DISK", &mut config.max_bytes_on_disk)?;
        load_env_var("FILE_RETENTION_PERIOD_MS", &mut config.file_retention_period_ms)?;
        load_env_path_opt("TELEMETRY_TEMP_DIR", &mut config.temp_dir);
        load_env_var("REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs)?;
        load_env_var("CONNECTION_TIMEOUT_SECS", &mut config.connection_timeout_secs)?;
        load_env_var("MAX_REDIRECTS", &mut config.max_redirects)?;

        load_env_var("LOG_LEVEL", &mut config.log_level)?;
        load_env_string_opt("BEARER_TOKEN", &mut config.bearer_token);
        load_env_bool("TELEMETRY_DISABLED", &mut config.disabled)?;

        config.finish()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::parse_file(path.as_ref())?;
        config.config_file = Some(path.as_ref().to_path_buf());
        config.finish()
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.channel = self.channel_group();
        self.sender = self.sender_group();
        self.disk = self.disk_group();
        Ok(())
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn finish(mut self) -> Result<Self, ConfigError> {
        self.post_process()?;
        self.validate()?;
        Ok(self)
    }
}
