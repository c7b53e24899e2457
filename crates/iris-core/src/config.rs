use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const TIMER_SCHEDULER_NAME: &str = "Scheduler: TIMER";
pub const FLUSH_SCHEDULER_NAME: &str = "Scheduler: FLUSH";

/// Seconds each 30-second poll is offset from the start of its interval.
pub const SAMPLE_30_SEC_OFFSET: i64 = 8;
/// Seconds each 5-minute poll is offset from the start of its interval.
pub const SAMPLE_5_MIN_OFFSET: i64 = 12;
/// Delay before the 5-minute flush runs, giving late samples a chance to land.
pub const FLUSH_DELAY_MS: u64 = 500;

/// Top-level config (iris.toml + IRIS_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrisConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_cycles")]
    pub cycles: Vec<CycleConfig>,
}

impl Default for IrisConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            cycles: default_cycles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Names of the two scheduler threads every server runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_timer_name")]
    pub timer_name: String,
    #[serde(default = "default_flush_name")]
    pub flush_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timer_name: default_timer_name(),
            flush_name: default_flush_name(),
        }
    }
}

/// Which scheduler runs a cycle's completion job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTarget {
    #[default]
    Timer,
    Flush,
}

/// One periodic fan-out cycle (e.g. the 30-second detector poll).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleConfig {
    pub name: String,
    pub interval_secs: i64,
    #[serde(default)]
    pub offset_secs: i64,
    /// Delay between the last sub-task finishing and the completion job.
    #[serde(default)]
    pub completion_delay_ms: u64,
    #[serde(default)]
    pub completion: CompletionTarget,
}

fn default_cycles() -> Vec<CycleConfig> {
    vec![
        CycleConfig {
            name: "30-Second".to_string(),
            interval_secs: 30,
            offset_secs: SAMPLE_30_SEC_OFFSET,
            completion_delay_ms: 0,
            completion: CompletionTarget::Timer,
        },
        CycleConfig {
            name: "5-Minute".to_string(),
            interval_secs: 300,
            offset_secs: SAMPLE_5_MIN_OFFSET,
            completion_delay_ms: FLUSH_DELAY_MS,
            completion: CompletionTarget::Flush,
        },
    ]
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
fn default_timer_name() -> String {
    TIMER_SCHEDULER_NAME.to_string()
}
fn default_flush_name() -> String {
    FLUSH_SCHEDULER_NAME.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.iris/iris.db", home)
}

impl IrisConfig {
    /// Load config from a TOML file with IRIS_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `IRIS_SCHEDULER__TIMER_NAME`.
    /// A missing file is not an error: defaults fill every section.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        let found = std::path::Path::new(&path).exists();
        debug!(path = %path, found, "loading config");

        let config: IrisConfig = Figment::from(Serialized::defaults(IrisConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("IRIS_").split("__"))
            .extract()
            .map_err(|e| crate::error::IrisError::Config(e.to_string()))?;

        info!(path = %path, cycles = config.cycles.len(), "config loaded");
        Ok(config)
    }

    /// Look up a cycle by name.
    pub fn cycle(&self, name: &str) -> Option<&CycleConfig> {
        self.cycles.iter().find(|c| c.name == name)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.iris/iris.toml", home)
}
