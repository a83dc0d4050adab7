//! Environment-variable helpers shared by the `from_env` constructors.
//!
//! Unset variables keep the default silently; unparseable ones keep the
//! default with a warning.

use std::str::FromStr;
use std::time::Duration;

/// Parse `name` as `T`, or `None` when unset or invalid.
pub fn env_parse<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    parse_value(name, &raw)
}

/// Parse `name` as a whole number of milliseconds.
pub fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_value<T>(name: &str, raw: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(variable = name, value = raw, error = %e, "Ignoring invalid environment value");
            None
        }
    }
}
