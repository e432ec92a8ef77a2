use std::{
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

/// service config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricConfig {
    controller: Controller,
    network_prefix: String,
    vlan_range: RangeInclusive<u16>,
    lock: LockPolicy,
    reconcile: ReconcilePolicy,
    path: Option<PathBuf>,
}

/// where and how to reach the fabric controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controller {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub read_timeout: Duration,
}

/// the primary credential is tried first, the fallback only if the
/// primary is absent, unreadable or rejected
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub private_key_file: Option<PathBuf>,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("private_key_file", &self.private_key_file)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub attempts: u32,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub interval: Duration,
    pub creating_timeout: Duration,
    pub deleting_timeout: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        wire::Lock::default().into()
    }
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        wire::Reconcile::default().into()
    }
}

impl From<wire::Lock> for LockPolicy {
    fn from(lock: wire::Lock) -> Self {
        Self {
            attempts: lock.attempts,
            retry_interval: lock.retry_interval,
        }
    }
}

impl From<wire::Reconcile> for ReconcilePolicy {
    fn from(r: wire::Reconcile) -> Self {
        Self {
            interval: r.interval,
            creating_timeout: r.creating_timeout,
            deleting_timeout: r.deleting_timeout,
        }
    }
}

impl TryFrom<wire::Controller> for Controller {
    type Error = anyhow::Error;

    fn try_from(c: wire::Controller) -> Result<Self> {
        if c.host.trim().is_empty() {
            bail!("controller host cannot be empty");
        }
        if c.request_timeout.is_zero() || c.connect_timeout.is_zero() || c.read_timeout.is_zero()
        {
            bail!("controller timeouts must be non-zero");
        }
        // an empty key path means "no key", the same as leaving it out
        let private_key_file = c
            .private_key_file
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        if private_key_file.is_none() && c.password.is_none() {
            bail!("controller needs a private_key_file or a password");
        }
        Ok(Self {
            keepalive: c.keepalive.unwrap_or(c.request_timeout),
            host: c.host,
            port: c.port,
            username: c.username,
            credentials: Credentials {
                private_key_file,
                password: c.password,
            },
            request_timeout: c.request_timeout,
            connect_timeout: c.connect_timeout,
            read_timeout: c.read_timeout,
        })
    }
}

impl TryFrom<wire::Config> for FabricConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        let wire::VlanRange { start, end } = cfg.vlan_range;
        if start == 0 || end > wire::MAX_VLAN_ID || start > end {
            bail!("vlan_range {start}..={end} must be within 1..={}", wire::MAX_VLAN_ID);
        }
        if cfg.lock.attempts == 0 {
            bail!("lock attempts must be at least 1");
        }
        if cfg.reconcile.interval.is_zero() {
            bail!("reconcile interval must be non-zero");
        }
        if cfg.network_prefix.is_empty() {
            bail!("network_prefix cannot be empty");
        }
        Ok(Self {
            controller: cfg.controller.try_into()?,
            network_prefix: cfg.network_prefix,
            vlan_range: start..=end,
            lock: cfg.lock.into(),
            reconcile: cfg.reconcile.into(),
            path: None,
        })
    }
}

impl FabricConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::parse_str(s)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let wire: wire::Config = match serde_json::from_str(s) {
            Ok(cfg) => cfg,
            Err(json_err) => serde_yaml::from_str(s).with_context(|| {
                format!("config is neither valid JSON ({json_err}) nor valid YAML")
            })?,
        };
        let config = Self::try_from(wire)?;
        debug!(?config);
        Ok(config)
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn network_prefix(&self) -> &str {
        &self.network_prefix
    }

    pub fn vlan_range(&self) -> RangeInclusive<u16> {
        self.vlan_range.clone()
    }

    pub fn lock(&self) -> LockPolicy {
        self.lock
    }

    pub fn reconcile(&self) -> ReconcilePolicy {
        self.reconcile
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml() {
        let cfg = FabricConfig::parse_str(
            r#"
controller:
  host: 10.0.0.1
  password: secret
  request_timeout: 30s
vlan_range: { start: 100, end: 200 }
"#,
        )
        .unwrap();
        assert_eq!(cfg.controller().host, "10.0.0.1");
        assert_eq!(cfg.controller().port, 31831);
        // keepalive follows the request timeout when unset
        assert_eq!(cfg.controller().keepalive, Duration::from_secs(30));
        assert_eq!(cfg.vlan_range(), 100..=200);
        assert_eq!(cfg.lock(), LockPolicy::default());
        assert!(cfg.path().is_none());
    }

    #[test]
    fn test_parse_json() {
        let cfg = FabricConfig::parse_str(
            r#"{"controller": {"private_key_file": "/tmp/id_rsa", "keepalive": "5s"}}"#,
        )
        .unwrap();
        let creds = &cfg.controller().credentials;
        assert_eq!(creds.private_key_file, Some(PathBuf::from("/tmp/id_rsa")));
        assert!(creds.password.is_none());
        assert_eq!(cfg.controller().keepalive, Duration::from_secs(5));
        assert_eq!(cfg.vlan_range(), 2..=4094);
    }

    #[test]
    fn test_missing_credentials() {
        let err = FabricConfig::parse_str("controller: { private_key_file: '' }").unwrap_err();
        assert!(err.to_string().contains("private_key_file or a password"));
    }

    #[test]
    fn test_bad_vlan_range() {
        for range in ["{ start: 0, end: 10 }", "{ start: 10, end: 5000 }", "{ start: 20, end: 10 }"] {
            let s = format!("controller: {{ password: a }}\nvlan_range: {range}");
            assert!(FabricConfig::parse_str(s).is_err(), "{range} should be rejected");
        }
    }

    #[test]
    fn test_password_redacted() {
        let cfg = FabricConfig::parse_str("controller: { password: hunter2 }").unwrap();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hunter2"));
    }
}
