//! Session pool configuration settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Which identity a requester may match an idle session on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingMatch {
    /// Never share
    None,
    /// Destination address and port
    Ip,
    /// Destination hostname and port
    Host,
    /// Address, port and hostname
    Both,
}

/// Who may reclaim an idle session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingPool {
    /// Only the worker that released it
    Owner,
    /// Any worker
    Global,
}

/// Who may reclaim a session parked in client-slave keep-alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientSlavePolicy {
    /// Nobody through a general lookup; only a claim by session id
    Never,
    /// The requester that released it
    OwnerOnly,
    /// Any compatible requester, like a shared session
    Any,
}

/// Main configuration for the session pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool released sessions at all (default: true)
    pub enabled: bool,

    /// Default sharing match for new requesters (default: both)
    pub sharing_match: SharingMatch,

    /// Default sharing pool for new requesters (default: global)
    pub sharing_pool: SharingPool,

    /// Reachability of client-slave sessions (default: owner_only)
    pub client_slave_policy: ClientSlavePolicy,

    /// Idle age after which `evict_idle` destroys a session, in seconds
    pub keep_alive_timeout_secs: u64,

    /// Maximum idle sessions per destination endpoint (0 = unlimited)
    pub max_idle_per_endpoint: usize,

    /// Check transport health before handing out an idle session
    pub check_health_on_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sharing_match: SharingMatch::Both,
            sharing_pool: SharingPool::Global,
            client_slave_policy: ClientSlavePolicy::OwnerOnly,
            keep_alive_timeout_secs: 60,
            max_idle_per_endpoint: 0,
            check_health_on_acquire: true,
        }
    }
}

impl PoolConfig {
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: PoolConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file if it exists, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::from_yaml_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env_vars() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(enabled) = env_bool("POOL_ENABLED") {
            self.enabled = enabled;
        }

        if let Ok(value) = std::env::var("POOL_SHARING_MATCH") {
            self.sharing_match = value.parse()?;
        }

        if let Ok(value) = std::env::var("POOL_SHARING_POOL") {
            self.sharing_pool = value.parse()?;
        }

        if let Ok(value) = std::env::var("POOL_CLIENT_SLAVE_POLICY") {
            self.client_slave_policy = value.parse()?;
        }

        if let Ok(timeout) = std::env::var("POOL_KEEP_ALIVE_TIMEOUT_SECS") {
            self.keep_alive_timeout_secs = timeout
                .parse()
                .with_context(|| format!("Invalid POOL_KEEP_ALIVE_TIMEOUT_SECS: {}", timeout))?;
        }

        if let Ok(max_idle) = std::env::var("POOL_MAX_IDLE_PER_ENDPOINT") {
            self.max_idle_per_endpoint = max_idle
                .parse()
                .with_context(|| format!("Invalid POOL_MAX_IDLE_PER_ENDPOINT: {}", max_idle))?;
        }

        if let Some(check) = env_bool("POOL_CHECK_HEALTH_ON_ACQUIRE") {
            self.check_health_on_acquire = check;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.keep_alive_timeout_secs == 0 {
            anyhow::bail!("keep_alive_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|value| value.to_lowercase() == "true")
}

impl FromStr for SharingMatch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "ip" => Ok(Self::Ip),
            "host" => Ok(Self::Host),
            "both" => Ok(Self::Both),
            other => Err(anyhow::anyhow!("Unknown sharing match '{}'", other)),
        }
    }
}

impl FromStr for SharingPool {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "global" => Ok(Self::Global),
            other => Err(anyhow::anyhow!("Unknown sharing pool '{}'", other)),
        }
    }
}

impl FromStr for ClientSlavePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "owner_only" => Ok(Self::OwnerOnly),
            "any" => Ok(Self::Any),
            other => Err(anyhow::anyhow!("Unknown client slave policy '{}'", other)),
        }
    }
}

impl fmt::Display for SharingMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Ip => "ip",
            Self::Host => "host",
            Self::Both => "both",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.enabled);
        assert_eq!(config.sharing_match, SharingMatch::Both);
        assert_eq!(config.sharing_pool, SharingPool::Global);
        assert_eq!(config.client_slave_policy, ClientSlavePolicy::OwnerOnly);
        assert_eq!(config.keep_alive_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_yaml_partial_config_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sharing_match: host\nsharing_pool: owner\nmax_idle_per_endpoint: 4").unwrap();

        let config = PoolConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.sharing_match, SharingMatch::Host);
        assert_eq!(config.sharing_pool, SharingPool::Owner);
        assert_eq!(config.max_idle_per_endpoint, 4);
        assert_eq!(config.keep_alive_timeout_secs, 60);
        assert!(config.check_health_on_acquire);
    }

    #[test]
    fn test_yaml_rejects_zero_timeout() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "keep_alive_timeout_secs: 0").unwrap();
        assert!(PoolConfig::from_yaml_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_reported() {
        assert!(PoolConfig::from_yaml_file("/nonexistent/pool.yml").is_err());
    }

    // The only test touching POOL_* variables, so it cannot race another test.
    #[test]
    fn test_env_overrides_defaults_and_file() {
        let vars = [
            ("POOL_SHARING_MATCH", "host"),
            ("POOL_MAX_IDLE_PER_ENDPOINT", "3"),
            ("POOL_CLIENT_SLAVE_POLICY", "any"),
            ("POOL_CHECK_HEALTH_ON_ACQUIRE", "false"),
        ];
        for (name, value) in vars {
            std::env::set_var(name, value);
        }

        let config = PoolConfig::from_env_vars().unwrap();
        assert_eq!(config.sharing_match, SharingMatch::Host);
        assert_eq!(config.max_idle_per_endpoint, 3);
        assert_eq!(config.client_slave_policy, ClientSlavePolicy::Any);
        assert!(!config.check_health_on_acquire);
        assert_eq!(config.sharing_pool, SharingPool::Global);

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sharing_match: ip\nsharing_pool: owner\nkeep_alive_timeout_secs: 15").unwrap();
        let config = PoolConfig::load(file.path()).unwrap();
        assert_eq!(config.sharing_match, SharingMatch::Host);
        assert_eq!(config.max_idle_per_endpoint, 3);
        assert_eq!(config.sharing_pool, SharingPool::Owner);
        assert_eq!(config.keep_alive_timeout_secs, 15);

        let missing = PoolConfig::load("/nonexistent/pool.yml").unwrap();
        assert_eq!(missing.sharing_match, SharingMatch::Host);
        assert_eq!(missing.keep_alive_timeout_secs, 60);

        std::env::set_var("POOL_SHARING_MATCH", "subnet");
        assert!(PoolConfig::from_env_vars().is_err());
        std::env::set_var("POOL_SHARING_MATCH", "host");
        std::env::set_var("POOL_KEEP_ALIVE_TIMEOUT_SECS", "0");
        assert!(PoolConfig::from_env_vars().is_err());

        for (name, _) in vars {
            std::env::remove_var(name);
        }
        std::env::remove_var("POOL_KEEP_ALIVE_TIMEOUT_SECS");
        assert_eq!(PoolConfig::from_env_vars().unwrap().sharing_match, SharingMatch::Both);
    }

    #[test]
    fn test_parse_policies() {
        assert_eq!("IP".parse::<SharingMatch>().unwrap(), SharingMatch::Ip);
        assert_eq!("global".parse::<SharingPool>().unwrap(), SharingPool::Global);
        assert_eq!("any".parse::<ClientSlavePolicy>().unwrap(), ClientSlavePolicy::Any);
        assert!("subnet".parse::<SharingMatch>().is_err());
    }
}
