use std::fmt;
use std::path::PathBuf;

use chrono::NaiveTime;

use crate::error::CoreError;
use crate::timeutil;

/// Seconds between the end of one orchestrator tick and the start of the next.
pub const TICK_INTERVAL_SECS: u64 = 60;

/// Resolved runtime configuration, loaded once from the environment at startup.
///
/// `Debug` is implemented by hand so credentials never end up in a log line.
#[derive(Clone)]
pub struct Config {
    pub alpha_url: String,
    pub language: String,
    pub timezone: String,
    pub reminder_offsets: Vec<i64>,
    pub quiet_hours: Option<(NaiveTime, NaiveTime)>,
    pub spug_quiet_channel: Option<String>,

    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: Option<String>,
    pub db_name: String,
    pub db_pool_minsize: u32,
    pub db_pool_maxsize: u32,

    pub spug_base_url: String,
    pub spug_token: Option<String>,
    pub spug_timeout_seconds: u64,
    pub spug_channel: String,
    pub spug_xsend_user_id: Option<String>,
    pub spug_proxy: Option<String>,

    pub playwright_proxy: Option<String>,
    pub log_level: String,

    pub lock_file: Option<PathBuf>,
    pub schema_path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("alpha_url", &self.alpha_url)
            .field("language", &self.language)
            .field("timezone", &self.timezone)
            .field("reminder_offsets", &self.reminder_offsets)
            .field("quiet_hours", &self.quiet_hours)
            .field("spug_quiet_channel", &self.spug_quiet_channel)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_user", &self.db_user)
            .field("db_password", &self.db_password.as_ref().map(|_| "***"))
            .field("db_name", &self.db_name)
            .field("db_pool_minsize", &self.db_pool_minsize)
            .field("db_pool_maxsize", &self.db_pool_maxsize)
            .field("spug_base_url", &self.spug_base_url)
            .field("spug_token", &self.spug_token.as_ref().map(|_| "***"))
            .field("spug_timeout_seconds", &self.spug_timeout_seconds)
            .field("spug_channel", &self.spug_channel)
            .field(
                "spug_xsend_user_id",
                &self.spug_xsend_user_id.as_ref().map(|_| "***"),
            )
            .field("spug_proxy", &self.spug_proxy)
            .field("playwright_proxy", &self.playwright_proxy)
            .field("log_level", &self.log_level)
            .field("lock_file", &self.lock_file)
            .field("schema_path", &self.schema_path)
            .finish()
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "1" | "true" | "yes" | "y" | "on" => true,
        _ => false,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from the process environment, applying the same
    /// defaults as the collector's settings module.
    pub fn from_env() -> Result<Self, CoreError> {
        let reminder_offsets = std::env::var("REMINDER_OFFSETS")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| {
                v.split(',')
                    .filter_map(|part| part.trim().parse::<i64>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec![30, 5]);

        let quiet_hours = env_opt("QUIET_HOURS")
            .as_deref()
            .and_then(timeutil::parse_quiet_hours);

        Ok(Config {
            alpha_url: env_string("ALPHA_URL", "https://alpha123.uk/zh"),
            language: env_string("LANGUAGE", "zh"),
            timezone: env_string("TIMEZONE", "Asia/Taipei"),
            reminder_offsets,
            quiet_hours,
            spug_quiet_channel: env_opt("SPUG_QUIET_CHANNEL"),

            db_host: env_string("DB_HOST", "127.0.0.1"),
            db_port: env_parsed("DB_PORT", 3306),
            db_user: env_string("DB_USER", "alpha"),
            db_password: env_opt("DB_PASSWORD"),
            db_name: env_string("DB_NAME", "alpha_bot"),
            db_pool_minsize: env_parsed("DB_POOL_MINSIZE", 1),
            db_pool_maxsize: env_parsed("DB_POOL_MAXSIZE", 5),

            spug_base_url: env_string("SPUG_BASE_URL", "https://push.spug.cc"),
            spug_token: env_opt("SPUG_TOKEN"),
            spug_timeout_seconds: env_parsed("SPUG_TIMEOUT_SECONDS", 10),
            spug_channel: env_string("SPUG_CHANNEL", "voice"),
            spug_xsend_user_id: env_opt("SPUG_XSEND_USER_ID"),
            spug_proxy: env_opt("SPUG_PROXY"),

            playwright_proxy: env_opt("PLAYWRIGHT_PROXY"),
            log_level: env_string("LOG_LEVEL", "info"),

            lock_file: env_opt("LOCK_FILE").map(PathBuf::from),
            schema_path: PathBuf::from(env_string("SCHEMA_PATH", "./schema.sql")),
        })
    }

    /// Validates settings that can only be checked once every field is loaded.
    ///
    /// Called once at startup; a notifier configured without an xsend user id
    /// can never successfully send, so we fail fast instead of at dispatch time.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.spug_xsend_user_id.is_none() {
            return Err(CoreError::ConfigIncomplete(
                "SPUG_XSEND_USER_ID must be set".to_string(),
            ));
        }
        timeutil::get_timezone(&self.timezone)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_truthy_tokens() {
        for tok in ["1", "true", "YES", "y", "On"] {
            assert!(parse_bool(tok, false), "expected {tok} to be truthy");
        }
        for tok in ["0", "false", "no", "", "garbage"] {
            assert!(!parse_bool(tok, false), "expected {tok} to be falsy");
        }
        assert!(parse_bool("", true));
    }
}
