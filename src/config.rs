//! Process configuration, read from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `ACCRUAL_SYSTEM_ADDRESS` | required |
//! | `DATABASE_URI` | empty (in-memory store) |
//! | `ACCRUAL_RETRY_INTERVAL_MS` | 50 |
//! | `ACCRUAL_MAX_RETRIES` | 5 |
//! | `ACCRUAL_RATE_LIMIT_PER_MINUTE` | 1000 |
//! | `ACCRUAL_REQUEST_TIMEOUT_MS` | 10000 |
//! | `ACCRUAL_WORKERS` | 16 |
//! | `ACCRUAL_SWEEP_INTERVAL_SECS` | 30 |
//! | `SHUTDOWN_GRACE_SECS` | 5 |

use std::num::{NonZeroU32, NonZeroU64};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::reconcile::RetryPolicy;

const DEFAULT_RATE_LIMIT_PER_MINUTE: NonZeroU32 = match NonZeroU32::new(1000) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};
const DEFAULT_SWEEP_INTERVAL_SECS: NonZeroU64 = match NonZeroU64::new(30) {
    Some(n) => n,
    None => NonZeroU64::MIN,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the accrual service.
    pub accrual_address: Url,
    /// SQLite file; `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    pub retry_policy: RetryPolicy,
    pub rate_limit_per_minute: NonZeroU32,
    pub request_timeout: Duration,
    pub workers: usize,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let accrual_address = get("ACCRUAL_SYSTEM_ADDRESS")
            .ok_or(ConfigError::Missing("ACCRUAL_SYSTEM_ADDRESS"))
            .and_then(|raw| parse_base_url("ACCRUAL_SYSTEM_ADDRESS", &raw))?;

        let defaults = RetryPolicy::default();
        let retry_policy = RetryPolicy {
            max_retries: parse_or("ACCRUAL_MAX_RETRIES", get("ACCRUAL_MAX_RETRIES"), defaults.max_retries)?,
            default_interval: Duration::from_millis(parse_or(
                "ACCRUAL_RETRY_INTERVAL_MS",
                get("ACCRUAL_RETRY_INTERVAL_MS"),
                defaults.default_interval.as_millis() as u64,
            )?),
        };

        let rate_limit_per_minute = parse_nonzero_or(
            "ACCRUAL_RATE_LIMIT_PER_MINUTE",
            get("ACCRUAL_RATE_LIMIT_PER_MINUTE"),
            DEFAULT_RATE_LIMIT_PER_MINUTE,
        )?;

        Ok(Self {
            accrual_address,
            database_path: get("DATABASE_URI").map(PathBuf::from),
            retry_policy,
            rate_limit_per_minute,
            request_timeout: Duration::from_millis(parse_or(
                "ACCRUAL_REQUEST_TIMEOUT_MS",
                get("ACCRUAL_REQUEST_TIMEOUT_MS"),
                10_000,
            )?),
            workers: parse_or("ACCRUAL_WORKERS", get("ACCRUAL_WORKERS"), 16)?,
            sweep_interval: Duration::from_secs(
                parse_nonzero_or::<NonZeroU64>(
                    "ACCRUAL_SWEEP_INTERVAL_SECS",
                    get("ACCRUAL_SWEEP_INTERVAL_SECS"),
                    DEFAULT_SWEEP_INTERVAL_SECS,
                )?
                .get(),
            ),
            shutdown_grace: Duration::from_secs(parse_or(
                "SHUTDOWN_GRACE_SECS",
                get("SHUTDOWN_GRACE_SECS"),
                5,
            )?),
        })
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            })
        }
    }
}

/// Like [`parse_or`] for counts and periods where zero is meaningless.
fn parse_nonzero_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_or(name, raw, default).map_err(|err| match err {
        ConfigError::Invalid { name, value, .. } if value.trim().parse::<u64>() == Ok(0) => {
            ConfigError::Invalid {
                name,
                value,
                reason: "must be greater than zero".to_string(),
            }
        }
        other => other,
    })
}

/// Accept `host:port` as well as full URLs; always end with `/` so relative
/// joins append instead of replacing the last path segment.
fn parse_base_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    let mut url = Url::parse(&with_scheme).map_err(|e| ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
