//! Operator configuration for the autowired daemon.
//!
//! No CLI flag parsing is in scope (spec §6); every input is an environment
//! variable with a default matching the original tool's compiled-in
//! constants, so a bare `AUTOWIRED_*`-free environment reproduces the
//! original's single hard-coded deployment.

use std::{env, path::PathBuf};

use ipnet::Ipv4Net;
use url::Url;

const DEFAULT_KV_PREFIX: &str = "autowire";
const DEFAULT_IFACE: &str = "wg0";
const DEFAULT_RANGE: &str = "192.168.200.0/24";
const DEFAULT_PORT: u16 = 51820;
const DEFAULT_NIC: &str = "enp0s8";
const DEFAULT_CONFIG_DIR: &str = "/etc/autowire";
const DEFAULT_CONSUL_ADDR: &str = "http://127.0.0.1:8500";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: unparseable CIDR range {value:?}")]
    InvalidRange { var: &'static str, value: String },
    #[error("{var}: unparseable port {value:?}")]
    InvalidPort { var: &'static str, value: String },
    #[error("{var}: unparseable URL {value:?}")]
    InvalidUrl { var: &'static str, value: String },
    #[error("{var} must not be empty")]
    Empty { var: &'static str },
}

/// Fully validated operator configuration, the daemon's one source of truth
/// for the names and addresses the rest of the crates operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Prefix under which all KV keys are namespaced, e.g. `autowire`.
    pub kv_prefix: String,
    /// Tunnel interface name, e.g. `wg0`.
    pub iface_name: String,
    /// The overlay CIDR range hosts claim addresses from.
    pub range: Ipv4Net,
    /// The tunnel's UDP listen port, advertised to peers.
    pub listen_port: u16,
    /// The local NIC whose address is this host's physical/endpoint IP.
    pub nic: String,
    /// Directory holding the persisted private key and driver config.
    pub config_dir: PathBuf,
    /// Base URL of the Consul HTTP API.
    pub consul_addr: Url,
}

impl Config {
    /// Builds the `<prefix>/<iface>/` KV key prefix shared by every key in
    /// the data model (spec §3).
    pub fn kv_root(&self) -> String {
        format!("{}/{}", self.kv_prefix, self.iface_name)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let kv_prefix = non_empty_env("AUTOWIRED_KV_PREFIX", DEFAULT_KV_PREFIX)?;
        let iface_name = non_empty_env("AUTOWIRED_IFACE", DEFAULT_IFACE)?;

        let range_str = env_or_default("AUTOWIRED_RANGE", DEFAULT_RANGE);
        let range = range_str.parse::<Ipv4Net>().map_err(|_| ConfigError::InvalidRange {
            var: "AUTOWIRED_RANGE",
            value: range_str,
        })?;

        let port_str = env_or_default("AUTOWIRED_PORT", &DEFAULT_PORT.to_string());
        let listen_port = port_str
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort { var: "AUTOWIRED_PORT", value: port_str })?;

        let nic = env_or_default("AUTOWIRED_NIC", DEFAULT_NIC);

        let config_dir =
            PathBuf::from(env_or_default("AUTOWIRED_CONFIG_DIR", DEFAULT_CONFIG_DIR));

        let consul_addr_str = env_or_default("AUTOWIRED_CONSUL_ADDR", DEFAULT_CONSUL_ADDR);
        let consul_addr = Url::parse(&consul_addr_str).map_err(|_| ConfigError::InvalidUrl {
            var: "AUTOWIRED_CONSUL_ADDR",
            value: consul_addr_str,
        })?;

        Ok(Self { kv_prefix, iface_name, range, listen_port, nic, config_dir, consul_addr })
    }

    /// Directory the tunnel private key lives under: `<config_dir>/<iface>`.
    pub fn key_dir(&self) -> PathBuf {
        self.config_dir.join(&self.iface_name)
    }
}

fn env_or_default(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn non_empty_env(var: &'static str, default: &str) -> Result<String, ConfigError> {
    let value = env_or_default(var, default);
    if value.trim().is_empty() {
        return Err(ConfigError::Empty { var });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "AUTOWIRED_KV_PREFIX",
            "AUTOWIRED_IFACE",
            "AUTOWIRED_RANGE",
            "AUTOWIRED_PORT",
            "AUTOWIRED_NIC",
            "AUTOWIRED_CONFIG_DIR",
            "AUTOWIRED_CONSUL_ADDR",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_match_original_tool() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.kv_prefix, "autowire");
        assert_eq!(config.iface_name, "wg0");
        assert_eq!(config.range.to_string(), "192.168.200.0/24");
        assert_eq!(config.listen_port, 51820);
        assert_eq!(config.kv_root(), "autowire/wg0");
    }

    #[test]
    fn rejects_unparseable_range() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("AUTOWIRED_RANGE", "not-a-cidr");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRange { .. }));
        clear_env();
    }
}
