//! Kernel-mode WireGuard backend (Linux)
//!
//! Peer and key management go through the WireGuard netlink API;
//! addressing and routes are programmed with `ip`. Requires
//! CAP_NET_ADMIN.

use super::platform;
use super::{BackendConfig, PeerConfig, PeerStats, WgStats, DEFAULT_MTU};
use crate::error::{CoreError, Result};
use crate::shell::{self, already_exists, SystemRunner};
use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

pub struct KernelBackend {
    device_name: String,
    runner: Arc<SystemRunner>,
    speeds: Arc<Mutex<(f64, f64)>>,
    sampler: JoinHandle<()>,
}

fn interface(name: &str) -> Result<InterfaceName> {
    name.parse()
        .map_err(|_| CoreError::InvalidConfig(format!("invalid interface name '{name}'")))
}

impl KernelBackend {
    pub async fn open(config: BackendConfig) -> Result<Self> {
        let iface = interface(&config.device_name)?;
        let runner = Arc::new(SystemRunner);

        // The netlink API configures but does not create the link.
        if let Err(e) = shell::run_ok(
            runner.as_ref(),
            "ip",
            &["link", "add", &config.device_name, "type", "wireguard"],
        )
        .await
        {
            if !already_exists(&e) {
                return Err(CoreError::Backend(format!(
                    "cannot create wireguard device: {e}"
                )));
            }
        }

        let private_key = Key::from_base64(&config.private_key)
            .map_err(|_| CoreError::InvalidConfig("invalid private key".into()))?;
        let listen_port = config.listen_port;
        tokio::task::spawn_blocking(move || {
            let mut update = DeviceUpdate::new().set_private_key(private_key);
            if let Some(port) = listen_port {
                update = update.set_listen_port(port);
            }
            update.apply(&iface, Backend::Kernel)
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
        .map_err(|e| CoreError::Backend(format!("device configuration failed: {e}")))?;

        let net: Ipv4Net = config
            .address
            .parse()
            .map_err(|_| CoreError::InvalidConfig(format!("bad interface address {}", config.address)))?;
        platform::configure_address(
            runner.as_ref(),
            &config.device_name,
            net,
            config.mtu.unwrap_or(DEFAULT_MTU),
        )
        .await?;

        let speeds = Arc::new(Mutex::new((0.0, 0.0)));
        let sampler = spawn_sampler(config.device_name.clone(), speeds.clone());

        tracing::info!(
            "kernel wireguard device {} up on {}",
            config.device_name,
            config.address
        );

        Ok(Self {
            device_name: config.device_name,
            runner,
            speeds,
            sampler,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub async fn add_peer(&self, peer: PeerConfig) -> Result<()> {
        let iface = interface(&self.device_name)?;
        let key = Key::from_base64(&peer.public_key)
            .map_err(|_| CoreError::InvalidConfig("invalid peer public key".into()))?;

        let mut builder = PeerConfigBuilder::new(&key).replace_allowed_ips();
        for cidr in &peer.allowed_ips {
            let net: IpNet = cidr
                .parse()
                .map_err(|_| CoreError::InvalidConfig(format!("bad allowed-ip {cidr}")))?;
            builder = builder.add_allowed_ip(net.addr(), net.prefix_len());
        }
        if let Some(endpoint) = peer.endpoint {
            builder = builder.set_endpoint(endpoint);
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            builder = builder.set_persistent_keepalive_interval(keepalive);
        }

        tokio::task::spawn_blocking(move || {
            DeviceUpdate::new()
                .add_peer(builder)
                .apply(&iface, Backend::Kernel)
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
        .map_err(|e| CoreError::Backend(format!("add_peer failed: {e}")))
    }

    pub async fn remove_peer(&self, public_key: &str) -> Result<()> {
        let iface = interface(&self.device_name)?;
        let key = Key::from_base64(public_key)
            .map_err(|_| CoreError::InvalidConfig("invalid peer public key".into()))?;

        // The kernel treats removal of an unknown peer as a no-op, which
        // is exactly the contract callers rely on.
        tokio::task::spawn_blocking(move || {
            DeviceUpdate::new()
                .remove_peer_by_key(&key)
                .apply(&iface, Backend::Kernel)
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
        .map_err(|e| CoreError::Backend(format!("remove_peer failed: {e}")))
    }

    pub async fn set_routes(&self, routes: &[String]) -> Result<()> {
        for cidr in routes {
            if let Err(e) = platform::add_route(self.runner.as_ref(), cidr, &self.device_name).await
            {
                tracing::warn!("failed to add route {cidr} via {}: {e}", self.device_name);
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<WgStats> {
        let (rx_bytes, tx_bytes) = read_totals(&self.device_name).await?;
        let (rx_speed, tx_speed) = *self.speeds.lock();
        Ok(WgStats {
            rx_bytes,
            tx_bytes,
            rx_speed,
            tx_speed,
        })
    }

    pub async fn peer_stats(&self) -> Result<Vec<PeerStats>> {
        let iface = interface(&self.device_name)?;
        let device = tokio::task::spawn_blocking(move || Device::get(&iface, Backend::Kernel))
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .map_err(|e| CoreError::Backend(format!("device query failed: {e}")))?;

        Ok(device
            .peers
            .into_iter()
            .map(|p| PeerStats {
                public_key: p.config.public_key.to_base64(),
                last_handshake: p.stats.last_handshake_time,
                rx_bytes: p.stats.rx_bytes,
                tx_bytes: p.stats.tx_bytes,
            })
            .collect())
    }

    pub async fn close(&self) -> Result<()> {
        self.sampler.abort();
        let iface = interface(&self.device_name)?;
        let deleted = tokio::task::spawn_blocking(move || {
            Device::get(&iface, Backend::Kernel).and_then(|d| d.delete())
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;
        if deleted.is_err() {
            // Netlink teardown can fail on half-created devices.
            shell::run_ok(
                self.runner.as_ref(),
                "ip",
                &["link", "del", &self.device_name],
            )
            .await?;
        }
        tracing::info!("kernel wireguard device {} closed", self.device_name);
        Ok(())
    }
}

async fn read_totals(device_name: &str) -> Result<(u64, u64)> {
    let iface = interface(device_name)?;
    let device = tokio::task::spawn_blocking(move || Device::get(&iface, Backend::Kernel))
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
        .map_err(|e| CoreError::Backend(format!("device query failed: {e}")))?;
    let rx = device.peers.iter().map(|p| p.stats.rx_bytes).sum();
    let tx = device.peers.iter().map(|p| p.stats.tx_bytes).sum();
    Ok((rx, tx))
}

fn spawn_sampler(device_name: String, speeds: Arc<Mutex<(f64, f64)>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last: Option<(u64, u64)> = None;
        loop {
            interval.tick().await;
            match read_totals(&device_name).await {
                Ok((rx, tx)) => {
                    if let Some((lrx, ltx)) = last {
                        *speeds.lock() =
                            (rx.saturating_sub(lrx) as f64, tx.saturating_sub(ltx) as f64);
                    }
                    last = Some((rx, tx));
                }
                Err(e) => {
                    tracing::debug!("stats sample failed for {device_name}: {e}");
                }
            }
        }
    })
}
