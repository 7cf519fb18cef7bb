use std::{str::FromStr, time::Duration};

use thiserror::Error;

use crate::moderation::MutePolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Process settings, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub debug: bool,
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub allowed_origins: Vec<String>,
    pub classifier_url: Option<String>,
    pub classifier_timeout: Duration,
    pub mute_policy: MutePolicy,
    pub outbound_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_name: "chatguard".to_owned(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
            debug: false,
            host: "0.0.0.0".to_owned(),
            port: 8000,
            database_url: "sqlite://chatguard.db?mode=rwc".to_owned(),
            allowed_origins: vec![
                "http://localhost:3000".to_owned(),
                "http://127.0.0.1:3000".to_owned(),
            ],
            classifier_url: None,
            classifier_timeout: Duration::from_secs(10),
            mute_policy: MutePolicy::default(),
            outbound_queue: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let threshold = parse_or(&lookup, "TOXIC_THRESHOLD", defaults.mute_policy.threshold)?;
        let mute_secs = parse_or(
            &lookup,
            "MUTE_DURATION_SECS",
            defaults.mute_policy.duration.whole_seconds(),
        )?;
        if threshold == 0 {
            return Err(ConfigError::Invalid { key: "TOXIC_THRESHOLD", value: "0".to_owned() });
        }
        if mute_secs <= 0 {
            return Err(ConfigError::Invalid { key: "MUTE_DURATION_SECS", value: mute_secs.to_string() });
        }

        let timeout_secs = parse_or(&lookup, "CLASSIFIER_TIMEOUT_SECS", defaults.classifier_timeout.as_secs())?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid { key: "CLASSIFIER_TIMEOUT_SECS", value: "0".to_owned() });
        }

        let debug = match lookup("DEBUG") {
            Some(value) => value.eq_ignore_ascii_case("true"),
            None => defaults.debug,
        };

        let allowed_origins = match lookup("ALLOWED_ORIGINS") {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_owned)
                .collect(),
            None => defaults.allowed_origins,
        };

        Ok(Config {
            app_name: lookup("APP_NAME").unwrap_or(defaults.app_name),
            app_version: lookup("APP_VERSION").unwrap_or(defaults.app_version),
            debug,
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            allowed_origins,
            classifier_url: lookup("CLASSIFIER_URL").filter(|url| !url.is_empty()),
            classifier_timeout: Duration::from_secs(timeout_secs),
            mute_policy: MutePolicy {
                threshold,
                duration: time::Duration::seconds(mute_secs),
            },
            outbound_queue: parse_or(&lookup, "OUTBOUND_QUEUE", defaults.outbound_queue)?.max(1),
        })
    }

    /// Host and port to bind; the host may be a name such as `localhost`.
    pub fn listen_addr(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
