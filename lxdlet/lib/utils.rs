//! Small conversion helpers for values crossing the flat config map.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use lxdstore::ConfigMap;

use crate::{LxdletError, LxdletResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Encodes a timestamp as a base-10 nanosecond string.
pub(crate) fn nanos_string(at: &DateTime<Utc>) -> String {
    at.timestamp_nanos_opt().unwrap_or_default().to_string()
}

/// Parses a base-10 nanosecond string back into a timestamp.
pub(crate) fn parse_nanos(key: &str, value: &str) -> LxdletResult<DateTime<Utc>> {
    let nanos: i64 = value
        .parse()
        .map_err(|_| LxdletError::InvalidConfigValue {
            key: key.to_string(),
            value: value.to_string(),
        })?;
    Ok(DateTime::from_timestamp_nanos(nanos))
}

/// Reads an optional nanosecond timestamp from a config map.
pub(crate) fn config_nanos(config: &ConfigMap, key: &str) -> LxdletResult<Option<DateTime<Utc>>> {
    match config.get(key) {
        Some(value) => Ok(Some(parse_nanos(key, value)?)),
        None => Ok(None),
    }
}

/// Reads an optional number from a config map, defaulting to zero when the
/// key is absent.
pub(crate) fn config_number<T>(config: &ConfigMap, key: &str) -> LxdletResult<T>
where
    T: FromStr + Default,
{
    match config.get(key) {
        Some(value) => value.parse().map_err(|_| LxdletError::InvalidConfigValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
        None => Ok(T::default()),
    }
}

/// Joins list entries into the comma-separated wire form.
pub(crate) fn join_csv(entries: &[String]) -> String {
    entries.join(",")
}

/// Splits the comma-separated wire form, dropping empty entries.
pub(crate) fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
