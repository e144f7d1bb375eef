//! `--flag value` parsing shared by the binaries

use std::str::FromStr;
use std::time::Duration;

use crate::error::ArgError;

/// Value following `flag`, if the flag is present
pub fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Whether a bare switch is present
pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Parse the value following `flag`
pub fn parse_value<T>(args: &[String], flag: &str) -> Result<Option<T>, ArgError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match parse_arg(args, flag) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|e: T::Err| ArgError {
            flag: flag.to_string(),
            reason: e.to_string(),
            value,
        }),
    }
}

/// Parse a duration following `flag`
///
/// Accepts `250ms`, `5s`, `2m`; a bare number is seconds.
pub fn parse_duration_arg(args: &[String], flag: &str) -> Result<Option<Duration>, ArgError> {
    match parse_arg(args, flag) {
        None => Ok(None),
        Some(value) => parse_duration(&value).map(Some).ok_or_else(|| ArgError {
            flag: flag.to_string(),
            value,
            reason: "expected a duration such as 100ms, 5s or 2m".to_string(),
        }),
    }
}

/// Parse `250ms` / `5s` / `2m` / bare seconds
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    s.parse().ok().map(Duration::from_secs)
}
