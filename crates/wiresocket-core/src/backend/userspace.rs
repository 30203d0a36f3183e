//! Userspace WireGuard backend
//!
//! Runs the WireGuard state machine in-process with boringtun, one
//! `Tunn` per peer, over a TUN device and a single UDP socket. This is
//! the only mode available off Linux and the default for client agents,
//! which cannot assume a kernel module.
//!
//! A single event-loop task owns all peer state and multiplexes four
//! sources: IP packets read from the TUN device (routed to a peer by
//! allowed-IP), datagrams from the UDP socket (routed to a peer by
//! handshake identification or session index), a 250 ms timer tick for
//! boringtun's retransmissions and keepalives, and a control channel
//! for peer add/remove/stats requests.

use super::platform;
use super::{BackendConfig, PeerConfig, PeerStats, WgStats, DEFAULT_MTU};
use crate::error::{CoreError, Result};
use crate::keys;
use crate::shell::SystemRunner;
use crate::MAX_DATAGRAM;
use boringtun::noise::handshake::parse_handshake_anon;
use boringtun::noise::{Packet, Tunn, TunnResult};
use boringtun::x25519;
use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Interval between boringtun timer ticks.
const TIMER_TICK: Duration = Duration::from_millis(250);

/// Work buffer size; boringtun needs payload + handshake overhead.
const WORK_BUF: usize = MAX_DATAGRAM + 96;

#[derive(Default)]
struct TrafficTotals {
    rx: AtomicU64,
    tx: AtomicU64,
}

struct Peer {
    tunn: Tunn,
    index: u32,
    public_key: String,
    allowed_ips: Vec<IpNet>,
    endpoint: Option<SocketAddr>,
    rx_bytes: u64,
    tx_bytes: u64,
}

impl Peer {
    fn allows(&self, addr: IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&addr))
    }
}

enum DeviceCommand {
    AddPeer(PeerConfig, oneshot::Sender<Result<()>>),
    RemovePeer(String, oneshot::Sender<()>),
    PeerStats(oneshot::Sender<Vec<PeerStats>>),
    Shutdown(oneshot::Sender<()>),
}

pub struct UserspaceBackend {
    device_name: String,
    cmd_tx: mpsc::Sender<DeviceCommand>,
    totals: Arc<TrafficTotals>,
    speeds: Arc<Mutex<(f64, f64)>>,
    runner: Arc<SystemRunner>,
    sampler: JoinHandle<()>,
}

impl UserspaceBackend {
    pub async fn open(config: BackendConfig) -> Result<Self> {
        let net: Ipv4Net = config
            .address
            .parse()
            .map_err(|_| CoreError::InvalidConfig(format!("bad interface address {}", config.address)))?;

        let private = x25519::StaticSecret::from(keys::decode_key(&config.private_key)?);
        let public = x25519::PublicKey::from(&private);

        let (tun_tx, tun_rx) = spawn_tun(&config, net)?;

        let bind_addr = match config.listen_port {
            Some(port) => format!("0.0.0.0:{port}"),
            None => "0.0.0.0:0".to_string(),
        };
        let udp = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| CoreError::ConnectionFailed(format!("cannot bind {bind_addr}: {e}")))?;

        let runner = Arc::new(SystemRunner);
        platform::set_dns(runner.as_ref(), &config.device_name, &config.dns).await;

        let totals = Arc::new(TrafficTotals::default());
        let speeds = Arc::new(Mutex::new((0.0, 0.0)));
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let device_loop = DeviceLoop {
            udp,
            tun_tx,
            tun_rx,
            cmd_rx,
            peers: HashMap::new(),
            by_index: HashMap::new(),
            next_index: 0,
            static_private: private,
            static_public: public,
            totals: totals.clone(),
        };
        tokio::spawn(device_loop.run());

        let sampler = spawn_sampler(totals.clone(), speeds.clone());

        tracing::info!(
            "userspace wireguard device {} up on {} (udp {})",
            config.device_name,
            config.address,
            bind_addr
        );

        Ok(Self {
            device_name: config.device_name,
            cmd_tx,
            totals,
            speeds,
            runner,
            sampler,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub async fn add_peer(&self, peer: PeerConfig) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(DeviceCommand::AddPeer(peer, tx))
            .await
            .map_err(|_| CoreError::Backend("device loop is gone".into()))?;
        rx.await
            .map_err(|_| CoreError::Backend("device loop dropped request".into()))?
    }

    pub async fn remove_peer(&self, public_key: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(DeviceCommand::RemovePeer(public_key.to_string(), tx))
            .await
            .map_err(|_| CoreError::Backend("device loop is gone".into()))?;
        let _ = rx.await;
        Ok(())
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
        let (rx_speed, tx_speed) = *self.speeds.lock();
        Ok(WgStats {
            rx_bytes: self.totals.rx.load(Ordering::Relaxed),
            tx_bytes: self.totals.tx.load(Ordering::Relaxed),
            rx_speed,
            tx_speed,
        })
    }

    pub async fn peer_stats(&self) -> Result<Vec<PeerStats>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(DeviceCommand::PeerStats(tx))
            .await
            .map_err(|_| CoreError::Backend("device loop is gone".into()))?;
        rx.await
            .map_err(|_| CoreError::Backend("device loop dropped request".into()))
    }

    pub async fn close(&self) -> Result<()> {
        self.sampler.abort();
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(DeviceCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        tracing::info!("userspace wireguard device {} closed", self.device_name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct DeviceLoop {
    udp: UdpSocket,
    tun_tx: mpsc::Sender<Vec<u8>>,
    tun_rx: mpsc::Receiver<Vec<u8>>,
    cmd_rx: mpsc::Receiver<DeviceCommand>,
    peers: HashMap<String, Peer>,
    by_index: HashMap<u32, String>,
    next_index: u32,
    static_private: x25519::StaticSecret,
    static_public: x25519::PublicKey,
    totals: Arc<TrafficTotals>,
}

impl DeviceLoop {
    async fn run(mut self) {
        let mut udp_buf = vec![0u8; MAX_DATAGRAM];
        let mut work_buf = vec![0u8; WORK_BUF];
        let mut timer = tokio::time::interval(TIMER_TICK);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                packet = self.tun_rx.recv() => match packet {
                    Some(ip_packet) => self.handle_tun_packet(&ip_packet, &mut work_buf).await,
                    None => {
                        tracing::warn!("TUN device closed, stopping wireguard loop");
                        break;
                    }
                },
                result = self.udp.recv_from(&mut udp_buf) => match result {
                    Ok((n, src)) => self.handle_udp_datagram(&udp_buf[..n], src, &mut work_buf).await,
                    Err(e) => tracing::warn!("UDP recv error: {e}"),
                },
                _ = timer.tick() => self.handle_timers(&mut work_buf).await,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(DeviceCommand::AddPeer(peer, reply)) => {
                        let result = self.add_peer(peer, &mut work_buf).await;
                        let _ = reply.send(result);
                    }
                    Some(DeviceCommand::RemovePeer(key, reply)) => {
                        self.remove_peer(&key);
                        let _ = reply.send(());
                    }
                    Some(DeviceCommand::PeerStats(reply)) => {
                        let _ = reply.send(self.peer_stats());
                    }
                    Some(DeviceCommand::Shutdown(reply)) => {
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    /// Outbound: IP packet from the TUN device, routed by allowed-IP.
    async fn handle_tun_packet(&mut self, ip_packet: &[u8], work_buf: &mut [u8]) {
        let Some(dst) = destination_address(ip_packet) else {
            return;
        };
        let Some(key) = self
            .peers
            .iter()
            .find(|(_, peer)| peer.allows(dst))
            .map(|(key, _)| key.clone())
        else {
            tracing::trace!("no peer routes {dst}");
            return;
        };
        let peer = self.peers.get_mut(&key).expect("peer key just looked up");

        match peer.tunn.encapsulate(ip_packet, work_buf) {
            TunnResult::WriteToNetwork(datagram) => {
                let Some(endpoint) = peer.endpoint else {
                    return;
                };
                if self.udp.send_to(datagram, endpoint).await.is_ok() {
                    peer.tx_bytes += ip_packet.len() as u64;
                    self.totals
                        .tx
                        .fetch_add(ip_packet.len() as u64, Ordering::Relaxed);
                }
            }
            TunnResult::Err(e) => tracing::debug!("encapsulate error: {e:?}"),
            _ => {}
        }
    }

    /// Inbound: encrypted datagram from the network.
    async fn handle_udp_datagram(&mut self, datagram: &[u8], src: SocketAddr, work_buf: &mut [u8]) {
        let parsed = match Tunn::parse_incoming_packet(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!("unparseable datagram from {src}: {e:?}");
                return;
            }
        };

        // Handshake initiations identify the sender cryptographically;
        // everything else carries our session index in the receiver slot,
        // whose upper bits are the peer index we assigned.
        let key = match &parsed {
            Packet::HandshakeInit(p) => {
                parse_handshake_anon(&self.static_private, &self.static_public, p)
                    .ok()
                    .map(|hs| keys::encode_key(&hs.peer_static_public))
            }
            Packet::HandshakeResponse(p) => self.by_index.get(&(p.receiver_idx >> 8)).cloned(),
            Packet::PacketCookieReply(p) => self.by_index.get(&(p.receiver_idx >> 8)).cloned(),
            Packet::PacketData(p) => self.by_index.get(&(p.receiver_idx >> 8)).cloned(),
        };
        let Some(peer) = key.and_then(|k| self.peers.get_mut(&k)) else {
            tracing::trace!("datagram from {src} matches no registered peer");
            return;
        };

        match peer.tunn.decapsulate(Some(src.ip()), datagram, work_buf) {
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                tracing::debug!("decapsulate error from {src}: {e:?}");
                return;
            }
            TunnResult::WriteToNetwork(response) => {
                let response = response.to_vec();
                let _ = self.udp.send_to(&response, src).await;
                // Drain anything boringtun queued behind the handshake.
                while let TunnResult::WriteToNetwork(queued) =
                    peer.tunn.decapsulate(None, &[], work_buf)
                {
                    let queued = queued.to_vec();
                    let _ = self.udp.send_to(&queued, src).await;
                }
            }
            TunnResult::WriteToTunnelV4(ip_packet, addr) => {
                if peer.allows(IpAddr::V4(addr)) {
                    peer.rx_bytes += ip_packet.len() as u64;
                    self.totals
                        .rx
                        .fetch_add(ip_packet.len() as u64, Ordering::Relaxed);
                    let _ = self.tun_tx.send(ip_packet.to_vec()).await;
                } else {
                    tracing::debug!("dropping packet from {src} with disallowed source {addr}");
                }
            }
            TunnResult::WriteToTunnelV6(ip_packet, addr) => {
                if peer.allows(IpAddr::V6(addr)) {
                    peer.rx_bytes += ip_packet.len() as u64;
                    self.totals
                        .rx
                        .fetch_add(ip_packet.len() as u64, Ordering::Relaxed);
                    let _ = self.tun_tx.send(ip_packet.to_vec()).await;
                }
            }
        }

        // Roaming: the latest source wins.
        peer.endpoint = Some(src);
    }

    /// Drive boringtun's retransmission and keepalive timers.
    async fn handle_timers(&mut self, work_buf: &mut [u8]) {
        for peer in self.peers.values_mut() {
            match peer.tunn.update_timers(work_buf) {
                TunnResult::WriteToNetwork(datagram) => {
                    if let Some(endpoint) = peer.endpoint {
                        let _ = self.udp.send_to(datagram, endpoint).await;
                    }
                }
                TunnResult::Err(e) => tracing::trace!("timer error: {e:?}"),
                _ => {}
            }
        }
    }

    async fn add_peer(&mut self, config: PeerConfig, work_buf: &mut [u8]) -> Result<()> {
        let public_bytes = keys::decode_key(&config.public_key)?;
        let allowed_ips = config
            .allowed_ips
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNet>()
                    .map_err(|_| CoreError::InvalidConfig(format!("bad allowed-ip {cidr}")))
            })
            .collect::<Result<Vec<_>>>()?;

        // Idempotent upsert: an existing peer keeps its sessions.
        if let Some(existing) = self.peers.get_mut(&config.public_key) {
            existing.allowed_ips = allowed_ips;
            if config.endpoint.is_some() {
                existing.endpoint = config.endpoint;
            }
            return Ok(());
        }

        let index = self.next_index;
        self.next_index += 1;

        let mut peer = Peer {
            tunn: Tunn::new(
                self.static_private.clone(),
                x25519::PublicKey::from(public_bytes),
                None,
                config.persistent_keepalive,
                index,
                None,
            ),
            index,
            public_key: config.public_key.clone(),
            allowed_ips,
            endpoint: config.endpoint,
            rx_bytes: 0,
            tx_bytes: 0,
        };

        // With a known endpoint we can open the session immediately
        // instead of waiting for the first outbound packet.
        if let Some(endpoint) = peer.endpoint {
            if let TunnResult::WriteToNetwork(init) =
                peer.tunn.format_handshake_initiation(work_buf, false)
            {
                let _ = self.udp.send_to(init, endpoint).await;
            }
        }

        self.by_index.insert(index, config.public_key.clone());
        self.peers.insert(config.public_key, peer);
        Ok(())
    }

    fn remove_peer(&mut self, public_key: &str) {
        if let Some(peer) = self.peers.remove(public_key) {
            self.by_index.remove(&peer.index);
            tracing::debug!("removed peer {public_key:.12}...");
        }
    }

    fn peer_stats(&self) -> Vec<PeerStats> {
        self.peers
            .values()
            .map(|peer| PeerStats {
                public_key: peer.public_key.clone(),
                last_handshake: peer
                    .tunn
                    .time_since_last_handshake()
                    .map(|age| SystemTime::now() - age),
                rx_bytes: peer.rx_bytes,
                tx_bytes: peer.tx_bytes,
            })
            .collect()
    }
}

/// Destination address of an IP packet, v4 or v6.
fn destination_address(packet: &[u8]) -> Option<IpAddr> {
    match *packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

fn spawn_sampler(totals: Arc<TrafficTotals>, speeds: Arc<Mutex<(f64, f64)>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = (0u64, 0u64);
        loop {
            interval.tick().await;
            let rx = totals.rx.load(Ordering::Relaxed);
            let tx = totals.tx.load(Ordering::Relaxed);
            *speeds.lock() = (
                rx.saturating_sub(last.0) as f64,
                tx.saturating_sub(last.1) as f64,
            );
            last = (rx, tx);
        }
    })
}

// ---------------------------------------------------------------------------
// TUN device plumbing
// ---------------------------------------------------------------------------

/// Open the TUN device and bridge it onto a channel pair: packets the
/// loop sends are written to the device, packets the device produces
/// arrive on the receiver.
#[cfg(unix)]
fn spawn_tun(
    config: &BackendConfig,
    net: Ipv4Net,
) -> Result<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>)> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut tun_config = tun::Configuration::default();
    tun_config
        .name(&config.device_name)
        .address(net.addr())
        .netmask(net.netmask())
        .mtu(config.mtu.unwrap_or(DEFAULT_MTU) as i32)
        .up();
    #[cfg(target_os = "linux")]
    tun_config.platform(|platform| {
        platform.packet_information(false);
    });

    let device = tun::create_as_async(&tun_config)
        .map_err(|e| CoreError::Internal(format!("cannot open TUN device: {e}")))?;
    let (mut reader, mut writer) = tokio::io::split(device);

    let (to_dev_tx, mut to_dev_rx) = mpsc::channel::<Vec<u8>>(256);
    let (from_dev_tx, from_dev_rx) = mpsc::channel::<Vec<u8>>(256);

    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if from_dev_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("TUN read error: {e}");
                    break;
                }
            }
        }
    });
    tokio::spawn(async move {
        while let Some(packet) = to_dev_rx.recv().await {
            if let Err(e) = writer.write_all(&packet).await {
                tracing::warn!("TUN write error: {e}");
                break;
            }
        }
    });

    Ok((to_dev_tx, from_dev_rx))
}

/// Windows: the Wintun driver provides the TUN surface; its blocking
/// session is bridged onto the same channel pair from plain threads.
#[cfg(windows)]
fn spawn_tun(
    config: &BackendConfig,
    net: Ipv4Net,
) -> Result<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>)> {
    let wintun = unsafe { wintun::load() }
        .map_err(|e| CoreError::Internal(format!("cannot load wintun.dll: {e}")))?;
    let adapter = wintun::Adapter::create(&wintun, &config.device_name, "WireSocket", None)
        .map_err(|e| CoreError::Internal(format!("cannot create wintun adapter: {e}")))?;
    let session = std::sync::Arc::new(
        adapter
            .start_session(wintun::MAX_RING_CAPACITY)
            .map_err(|e| CoreError::Internal(format!("cannot start wintun session: {e}")))?,
    );

    // Addressing is done with netsh; wintun only moves packets.
    let runner = SystemRunner;
    let dev = config.device_name.clone();
    let mtu = config.mtu.unwrap_or(DEFAULT_MTU);
    tokio::spawn(async move {
        if let Err(e) = platform::configure_address(&runner, &dev, net, mtu).await {
            tracing::warn!("failed to address wintun adapter {dev}: {e}");
        }
    });

    let (to_dev_tx, mut to_dev_rx) = mpsc::channel::<Vec<u8>>(256);
    let (from_dev_tx, from_dev_rx) = mpsc::channel::<Vec<u8>>(256);

    let rx_session = session.clone();
    std::thread::spawn(move || loop {
        match rx_session.receive_blocking() {
            Ok(packet) => {
                if from_dev_tx.blocking_send(packet.bytes().to_vec()).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    });
    std::thread::spawn(move || {
        while let Some(packet) = to_dev_rx.blocking_recv() {
            match session.allocate_send_packet(packet.len() as u16) {
                Ok(mut send) => {
                    send.bytes_mut().copy_from_slice(&packet);
                    session.send_packet(send);
                }
                Err(e) => {
                    tracing::warn!("wintun send allocation failed: {e}");
                    break;
                }
            }
        }
    });

    Ok((to_dev_tx, from_dev_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_address_v4() {
        let mut packet = [0u8; 20];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&[10, 0, 0, 7]);
        assert_eq!(
            destination_address(&packet),
            Some("10.0.0.7".parse().unwrap())
        );
    }

    #[test]
    fn test_destination_address_rejects_garbage() {
        assert_eq!(destination_address(&[]), None);
        assert_eq!(destination_address(&[0x45; 4]), None);
        let mut packet = [0u8; 20];
        packet[0] = 0x25; // version 2
        assert_eq!(destination_address(&packet), None);
    }

    #[test]
    fn test_peer_allows() {
        let pair = crate::keys::KeyPair::generate();
        let secret = x25519::StaticSecret::from(crate::keys::decode_key(&pair.private_key).unwrap());
        let peer = Peer {
            tunn: Tunn::new(
                secret.clone(),
                x25519::PublicKey::from(&secret),
                None,
                None,
                0,
                None,
            ),
            index: 0,
            public_key: pair.public_key,
            allowed_ips: vec!["10.0.0.2/32".parse().unwrap()],
            endpoint: None,
            rx_bytes: 0,
            tx_bytes: 0,
        };
        assert!(peer.allows("10.0.0.2".parse().unwrap()));
        assert!(!peer.allows("10.0.0.3".parse().unwrap()));
    }
}
