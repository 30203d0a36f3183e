//! WireGuard backend abstraction
//!
//! One capability set over two data planes: the Linux kernel module
//! (netlink) and an in-process userspace engine (boringtun + TUN).
//! The mode is chosen from configuration at open time; everything else
//! in the tree talks to [`WgBackend`] and never cares which one runs
//! underneath.

pub mod platform;
pub mod userspace;

#[cfg(target_os = "linux")]
pub mod kernel;

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::SystemTime;

/// Default interface MTU for WireGuard over a tunneled transport.
pub const DEFAULT_MTU: u16 = 1420;

/// Interface configuration handed to [`WgBackend::open`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Interface name, e.g. `wg0` (`utun` names on macOS).
    pub device_name: String,
    /// Base64 private key of this interface.
    pub private_key: String,
    /// Interface address in CIDR form, e.g. `10.0.0.1/24`.
    pub address: String,
    /// UDP listen port; `None` binds an ephemeral port (client side).
    pub listen_port: Option<u16>,
    /// DNS servers to program on the host, client side only.
    pub dns: Vec<String>,
    /// MTU; defaults to [`DEFAULT_MTU`].
    pub mtu: Option<u16>,
}

/// A peer to register on the interface.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Base64 public key.
    pub public_key: String,
    /// Remote endpoint, when known.
    pub endpoint: Option<SocketAddr>,
    /// Allowed-IP prefixes in CIDR form.
    pub allowed_ips: Vec<String>,
    /// Persistent keepalive interval in seconds.
    pub persistent_keepalive: Option<u16>,
}

/// Aggregate interface counters plus 1-second sampled rates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WgStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Receive rate in bytes per second, sampled over the last second.
    pub rx_speed: f64,
    /// Transmit rate in bytes per second, sampled over the last second.
    pub tx_speed: f64,
}

/// Per-peer counters and handshake age.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub public_key: String,
    /// `None` until the first handshake completes.
    pub last_handshake: Option<SystemTime>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Which data plane to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Kernel,
    Userspace,
}

impl std::str::FromStr for BackendMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kernel" => Ok(Self::Kernel),
            "userspace" => Ok(Self::Userspace),
            other => Err(CoreError::InvalidConfig(format!(
                "unknown wireguard mode '{other}' (expected kernel or userspace)"
            ))),
        }
    }
}

/// A running WireGuard interface.
///
/// Tagged variant rather than a trait object: the mode is fixed at open
/// time and nothing else dispatches dynamically on it.
pub enum WgBackend {
    #[cfg(target_os = "linux")]
    Kernel(kernel::KernelBackend),
    Userspace(userspace::UserspaceBackend),
}

impl WgBackend {
    /// Create (or take over) the interface described by `config`.
    pub async fn open(mode: BackendMode, config: BackendConfig) -> Result<Self> {
        match mode {
            BackendMode::Kernel => {
                #[cfg(target_os = "linux")]
                {
                    Ok(Self::Kernel(kernel::KernelBackend::open(config).await?))
                }
                #[cfg(not(target_os = "linux"))]
                {
                    let _ = config;
                    Err(CoreError::InvalidConfig(
                        "kernel mode requires Linux; use mode \"userspace\"".into(),
                    ))
                }
            }
            BackendMode::Userspace => Ok(Self::Userspace(
                userspace::UserspaceBackend::open(config).await?,
            )),
        }
    }

    /// Interface name as configured.
    pub fn device_name(&self) -> &str {
        match self {
            #[cfg(target_os = "linux")]
            Self::Kernel(b) => b.device_name(),
            Self::Userspace(b) => b.device_name(),
        }
    }

    /// Register a peer. Re-adding an existing public key updates its
    /// endpoint and allowed-IPs instead of failing.
    pub async fn add_peer(&self, peer: PeerConfig) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Kernel(b) => b.add_peer(peer).await,
            Self::Userspace(b) => b.add_peer(peer).await,
        }
    }

    /// Remove a peer; removing an unknown key is a no-op.
    pub async fn remove_peer(&self, public_key: &str) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Kernel(b) => b.remove_peer(public_key).await,
            Self::Userspace(b) => b.remove_peer(public_key).await,
        }
    }

    /// Program host routes through the interface. Best-effort: failures
    /// are logged, not returned.
    pub async fn set_routes(&self, routes: &[String]) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Kernel(b) => b.set_routes(routes).await,
            Self::Userspace(b) => b.set_routes(routes).await,
        }
    }

    /// Aggregate counters and sampled rates.
    pub async fn stats(&self) -> Result<WgStats> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Kernel(b) => b.stats().await,
            Self::Userspace(b) => b.stats().await,
        }
    }

    /// Per-peer counters and handshake times.
    pub async fn peer_stats(&self) -> Result<Vec<PeerStats>> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Kernel(b) => b.peer_stats().await,
            Self::Userspace(b) => b.peer_stats().await,
        }
    }

    /// Tear down the interface and any workers.
    pub async fn close(&self) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Kernel(b) => b.close().await,
            Self::Userspace(b) => b.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_mode_parse() {
        assert_eq!("kernel".parse::<BackendMode>().unwrap(), BackendMode::Kernel);
        assert_eq!(
            "Userspace".parse::<BackendMode>().unwrap(),
            BackendMode::Userspace
        );
        assert!("tcp".parse::<BackendMode>().is_err());
    }
}
