use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            scheduler: SchedulerConfig::from_env()?,
        })
    }
}

/// Tunables for the schedule and task engines.
///
/// Every option has a default; environment variables override them.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Debounce window for reschedule requests.
    pub min_recalculation_interval_ms: u64,
    /// Upper clamp for any armed timer delay.
    pub max_timeout_ms: u64,
    /// How often the job queue client checks an in-flight job for completion.
    pub completion_check_interval_ms: u64,
    /// Task engine tick.
    pub polling_interval_secs: u64,
    /// Per-handler timeout unless overridden by the handler descriptor.
    pub default_timeout_ms: u64,
    /// `run_started_at` age beyond which a running task is considered stuck.
    pub stuck_task_timeout_ms: u64,
    /// Default disable/error threshold for consecutive failures.
    pub max_consecutive_failures: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_recalculation_interval_ms: 100,
            max_timeout_ms: 2_147_483_647,
            completion_check_interval_ms: 1_000,
            polling_interval_secs: 1,
            default_timeout_ms: 300_000,
            stuck_task_timeout_ms: 3_600_000,
            max_consecutive_failures: 5,
        }
    }
}

impl SchedulerConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            min_recalculation_interval_ms: env_or(
                "SCHEDULER_MIN_RECALCULATION_INTERVAL_MS",
                defaults.min_recalculation_interval_ms,
            )?,
            max_timeout_ms: env_or("SCHEDULER_MAX_TIMEOUT_MS", defaults.max_timeout_ms)?,
            completion_check_interval_ms: env_or(
                "SCHEDULER_COMPLETION_CHECK_INTERVAL_MS",
                defaults.completion_check_interval_ms,
            )?,
            polling_interval_secs: env_or(
                "SCHEDULER_POLLING_INTERVAL_SECS",
                defaults.polling_interval_secs,
            )?,
            default_timeout_ms: env_or("SCHEDULER_DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms)?,
            stuck_task_timeout_ms: env_or(
                "SCHEDULER_STUCK_TASK_TIMEOUT_MS",
                defaults.stuck_task_timeout_ms,
            )?,
            max_consecutive_failures: env_or(
                "SCHEDULER_MAX_CONSECUTIVE_FAILURES",
                defaults.max_consecutive_failures,
            )?,
        })
    }
}

/// Parse an optional environment variable, keeping the default when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}
