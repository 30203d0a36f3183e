//! WebSocket↔UDP tunnel client
//!
//! The mirror of the tunnel node's relay. A loopback UDP listener
//! accepts datagrams from the local WireGuard interface; each one
//! becomes a binary WebSocket frame. Frames coming back are written to
//! the most recent UDP source address (WireGuard uses one source port
//! per interface, so "last" is stable).

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use wiresocket_core::{CoreError, Result, MAX_DATAGRAM};

/// Deadline on UDP reads so the pump can poll the stop flag.
const UDP_POLL: Duration = Duration::from_secs(1);

pub struct WsTunnelClient {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsTunnelClient {
    /// Dial `tunnel_url` and start the two pump loops. Returns the
    /// client and a channel that yields one message when the session
    /// dies (transport error or server close).
    pub async fn connect(tunnel_url: &str) -> Result<(Self, mpsc::Receiver<String>)> {
        let (ws_stream, _) = connect_async(tunnel_url)
            .await
            .map_err(|e| CoreError::ConnectionFailed(format!("websocket dial failed: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let udp = Arc::new(
            UdpSocket::bind("127.0.0.1:0")
                .await
                .map_err(|e| CoreError::ConnectionFailed(format!("cannot bind relay socket: {e}")))?,
        );
        let local_addr = udp.local_addr()?;
        tracing::info!("tunnel relay listening on {local_addr} for {tunnel_url}");

        let stop = Arc::new(AtomicBool::new(false));
        let last_source: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
        let (closed_tx, closed_rx) = mpsc::channel::<String>(2);

        // UDP→WS: wrap each datagram in one binary frame.
        let udp_out = udp.clone();
        let source_out = last_source.clone();
        let stop_out = stop.clone();
        let closed_out = closed_tx.clone();
        let to_ws = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                if stop_out.load(Ordering::SeqCst) {
                    break;
                }
                match tokio::time::timeout(UDP_POLL, udp_out.recv_from(&mut buf)).await {
                    Ok(Ok((n, src))) => {
                        *source_out.lock() = Some(src);
                        if let Err(e) = ws_tx.send(Message::Binary(buf[..n].to_vec())).await {
                            let _ = closed_out.try_send(format!("websocket send failed: {e}"));
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        let _ = closed_out.try_send(format!("relay socket error: {e}"));
                        break;
                    }
                    // Deadline: just poll the stop flag again.
                    Err(_) => continue,
                }
            }
            let _ = ws_tx.close().await;
        });

        // WS→UDP: unwrap each binary frame to the last seen source.
        let udp_in = udp.clone();
        let stop_in = stop.clone();
        let from_ws = tokio::spawn(async move {
            loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Binary(payload))) => {
                        let target = *last_source.lock();
                        if let Some(addr) = target {
                            if let Err(e) = udp_in.send_to(&payload, addr).await {
                                let _ = closed_tx.try_send(format!("relay write failed: {e}"));
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        let _ = closed_tx.try_send("server closed the tunnel".to_string());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = closed_tx.try_send(format!("websocket error: {e}"));
                        break;
                    }
                    None => {
                        let _ = closed_tx.try_send("websocket stream ended".to_string());
                        break;
                    }
                }
            }
            stop_in.store(true, Ordering::SeqCst);
        });

        Ok((
            Self {
                local_addr,
                stop,
                tasks: vec![to_ws, from_ws],
            },
            closed_rx,
        ))
    }

    /// Loopback endpoint the WireGuard interface should use as its peer
    /// endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop both pumps and close the sockets.
    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for WsTunnelClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
    use axum::routing::any;
    use axum::Router;
    use tokio::net::TcpListener;

    /// Echo tunnel server: every binary frame comes straight back.
    async fn spawn_echo_server() -> String {
        async fn upgrade(ws: WebSocketUpgrade) -> impl axum::response::IntoResponse {
            ws.on_upgrade(|mut socket: WebSocket| async move {
                while let Some(Ok(message)) = socket.recv().await {
                    if let AxMessage::Binary(payload) = message {
                        if socket.send(AxMessage::Binary(payload)).await.is_err() {
                            break;
                        }
                    }
                }
            })
        }
        let app = Router::new().route("/", any(upgrade));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{addr}/")
    }

    #[tokio::test]
    async fn test_datagram_round_trip_via_echo() {
        let url = spawn_echo_server().await;
        let (client, _closed) = WsTunnelClient::connect(&url).await.unwrap();

        // Stand-in for the local WireGuard interface.
        let wg = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload = vec![7u8; 512];
        wg.send_to(&payload, client.local_addr()).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), wg.recv_from(&mut buf))
            .await
            .expect("echo datagram")
            .unwrap();
        assert_eq!(&buf[..n], &payload[..]);
        assert_eq!(from, client.local_addr());

        client.close();
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        let result = WsTunnelClient::connect("ws://127.0.0.1:1/").await;
        assert!(matches!(result, Err(CoreError::ConnectionFailed(_))));
    }
}
