//! on-disk shape of the service config
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub controller: Controller,
    #[serde(default = "default_network_prefix")]
    pub network_prefix: String,
    #[serde(default)]
    pub vlan_range: VlanRange,
    #[serde(default)]
    pub lock: Lock,
    #[serde(default)]
    pub reconcile: Reconcile,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Controller {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub private_key_file: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub request_timeout: Duration,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub connect_timeout: Duration,
    /// defaults to the request timeout
    #[serde(
        default,
        deserialize_with = "deserialize_optional_duration",
        serialize_with = "serialize_optional_duration"
    )]
    pub keepalive: Option<Duration>,
    #[serde(
        default = "default_read_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub read_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct VlanRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Lock {
    #[serde(default = "default_lock_attempts")]
    pub attempts: u32,
    #[serde(
        default = "default_lock_retry_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reconcile {
    #[serde(
        default = "default_reconcile_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        default = "default_creating_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub creating_timeout: Duration,
    #[serde(
        default = "default_deleting_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub deleting_timeout: Duration,
}

pub const MIN_VLAN_ID: u16 = 2;
pub const MAX_VLAN_ID: u16 = 4094;

pub fn default_network_prefix() -> String {
    "__OpenStack__".to_owned()
}

pub fn default_host() -> String {
    "127.0.0.1".to_owned()
}

pub const fn default_port() -> u16 {
    31831
}

pub fn default_username() -> String {
    "admin".to_owned()
}

pub const fn default_request_timeout() -> Duration {
    Duration::from_secs(90)
}

pub const fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

pub const fn default_read_timeout() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_lock_attempts() -> u32 {
    10
}

pub const fn default_lock_retry_interval() -> Duration {
    Duration::from_millis(500)
}

pub const fn default_reconcile_interval() -> Duration {
    Duration::from_secs(10)
}

pub const fn default_creating_timeout() -> Duration {
    Duration::from_secs(60)
}

pub const fn default_deleting_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for VlanRange {
    fn default() -> Self {
        Self {
            start: MIN_VLAN_ID,
            end: MAX_VLAN_ID,
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self {
            attempts: default_lock_attempts(),
            retry_interval: default_lock_retry_interval(),
        }
    }
}

impl Default for Reconcile {
    fn default() -> Self {
        Self {
            interval: default_reconcile_interval(),
            creating_timeout: default_creating_timeout(),
            deleting_timeout: default_deleting_timeout(),
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            private_key_file: None,
            password: None,
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            keepalive: None,
            read_timeout: default_read_timeout(),
        }
    }
}

/// Parse a duration string with optional time units
/// Accepts: "90", "500ms", "90s", "2m", "1h"
/// If no unit is specified, assumes seconds
pub(crate) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::Error::msg("empty duration string"));
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            WireDuration::Seconds(val) => Ok(Duration::from_secs(val)),
            WireDuration::String(s) => parse_duration(&s).map_err(E::custom),
        }
    }
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    WireDuration::deserialize(de)?.into_duration()
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<WireDuration>::deserialize(de)?
        .map(WireDuration::into_duration)
        .transpose()
}

fn serialize_duration<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_str(&format!("{}ms", d.as_millis()))
}

fn serialize_optional_duration<S: Serializer>(
    d: &Option<Duration>,
    ser: S,
) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => serialize_duration(d, ser),
        None => ser.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static EXAMPLE: &str = include_str!("../../../../example.yaml");

    // test we can decode the example file & write it back out
    #[test]
    fn test_example() {
        let cfg: crate::wire::Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.controller.port, 31831);
        assert_eq!(cfg.reconcile.creating_timeout, Duration::from_secs(60));
        let s = serde_yaml::to_string(&cfg).unwrap();
        let back: crate::wire::Config = serde_yaml::from_str(&s).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_defaults_filled() {
        let cfg: crate::wire::Config = serde_yaml::from_str("controller: {}").unwrap();
        assert_eq!(cfg.controller.host, "127.0.0.1");
        assert_eq!(cfg.controller.username, "admin");
        assert_eq!(cfg.controller.request_timeout, Duration::from_secs(90));
        assert_eq!(cfg.network_prefix, "__OpenStack__");
        assert_eq!(cfg.vlan_range, VlanRange { start: 2, end: 4094 });
        assert_eq!(cfg.lock.attempts, 10);
        assert_eq!(cfg.lock.retry_interval, Duration::from_millis(500));
        assert_eq!(cfg.reconcile.deleting_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 10s ").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("-1").is_err());
    }

    #[test]
    fn test_numeric_duration_is_seconds() {
        let cfg: crate::wire::Config =
            serde_yaml::from_str("controller: { request_timeout: 30 }").unwrap();
        assert_eq!(cfg.controller.request_timeout, Duration::from_secs(30));
    }
}
