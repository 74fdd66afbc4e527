//! Configuration resolution.
//!
//! Every tunable is resolved with the same three-tier priority:
//!
//! 1. **Parameter** - explicitly provided value (highest priority)
//! 2. **Environment Variable** - value from the environment
//! 3. **Default** - built-in default (lowest priority)
//!
//! Unparseable environment values fall through to the default.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DISCO_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `DISCO_COMMAND_TIMEOUT` | 180s | Command execution timeout in seconds |
//! | `DISCO_MAX_RETRIES` | 0 | Transport reconnect attempts per candidate |
//! | `DISCO_RETRY_DELAY_MS` | 1000ms | Initial reconnect delay, capped at 10s |
//! | `DISCO_COMPRESSION` | true | Enable zlib compression |
//! | `DISCO_HOSTS_FILE` | /etc/hosts | Hosts file for the DNS chain |
//! | `DISCO_STOP_ON_FIRST` | true | Stop after the first working credential |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;

/// Candidates are not re-run by default; the next credential is the retry.
pub const DEFAULT_MAX_RETRIES: u32 = 0;

pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub const DEFAULT_HOSTS_FILE: &str = "/etc/hosts";

pub const CONNECT_TIMEOUT_ENV_VAR: &str = "DISCO_CONNECT_TIMEOUT";
pub const COMMAND_TIMEOUT_ENV_VAR: &str = "DISCO_COMMAND_TIMEOUT";
pub const MAX_RETRIES_ENV_VAR: &str = "DISCO_MAX_RETRIES";
pub const RETRY_DELAY_MS_ENV_VAR: &str = "DISCO_RETRY_DELAY_MS";
pub const COMPRESSION_ENV_VAR: &str = "DISCO_COMPRESSION";
pub const HOSTS_FILE_ENV_VAR: &str = "DISCO_HOSTS_FILE";
pub const STOP_ON_FIRST_ENV_VAR: &str = "DISCO_STOP_ON_FIRST";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
}

/// Parameter, then parseable environment value, then `default`.
fn resolve<T: FromStr>(param: Option<T>, var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

/// A set variable is `true` only for "true" (any case) or "1".
fn resolve_flag(param: Option<bool>, var: &str, default: bool) -> bool {
    if let Some(flag) = param {
        return flag;
    }

    match env::var(var) {
        Ok(raw) => raw.eq_ignore_ascii_case("true") || raw == "1",
        Err(_) => default,
    }
}

pub fn resolve_connect_timeout(secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        secs,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

pub fn resolve_command_timeout(secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        secs,
        COMMAND_TIMEOUT_ENV_VAR,
        DEFAULT_COMMAND_TIMEOUT_SECS,
    ))
}

pub fn resolve_max_retries(retries: Option<u32>) -> u32 {
    resolve(retries, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

/// Capped at [`MAX_RETRY_DELAY`].
pub fn resolve_retry_delay(millis: Option<u64>) -> Duration {
    Duration::from_millis(resolve(millis, RETRY_DELAY_MS_ENV_VAR, DEFAULT_RETRY_DELAY_MS))
        .min(MAX_RETRY_DELAY)
}

pub fn resolve_compression(compress: Option<bool>) -> bool {
    resolve_flag(compress, COMPRESSION_ENV_VAR, true)
}

pub fn resolve_stop_on_first(stop: Option<bool>) -> bool {
    resolve_flag(stop, STOP_ON_FIRST_ENV_VAR, true)
}

pub fn resolve_hosts_file(path: Option<PathBuf>) -> PathBuf {
    path.or_else(|| env::var_os(HOSTS_FILE_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HOSTS_FILE))
}

/// Value of a variable that has no default.
pub fn require_env(var: &'static str) -> Result<String, ConfigError> {
    env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(var))
}
