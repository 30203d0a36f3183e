//! WebSocket↔UDP tunnel server
//!
//! Every request on the tunnel listener is upgraded to a WebSocket; one
//! binary frame carries exactly one UDP datagram. Each connection gets
//! its own UDP socket connected to the local WireGuard listen port, so
//! WireGuard sees one remote endpoint per client and the reply path
//! demultiplexes for free.
//!
//! Two pump loops per connection, joined by `select!`: a frame arriving
//! is written to the UDP socket, a datagram arriving is sent as one
//! binary frame. Either side closing, erroring, or the 30-second UDP
//! read deadline expiring terminates both and drops both sockets.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use wiresocket_core::MAX_DATAGRAM;

use crate::config::TunnelConfig;

/// Idle deadline on the WireGuard-facing UDP socket.
const UDP_READ_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct WsState {
    /// Local WireGuard endpoint datagrams are relayed to.
    wg_addr: SocketAddr,
}

/// The tunnel router: any path, any method, upgrade and relay.
pub fn router(wg_addr: SocketAddr) -> Router {
    Router::new()
        .route("/", any(upgrade))
        .route("/*path", any(upgrade))
        .with_state(WsState { wg_addr })
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = relay(socket, state.wg_addr).await {
            tracing::debug!("tunnel session ended: {e}");
        }
    })
}

/// Relay one WebSocket connection against a dedicated UDP socket.
async fn relay(socket: WebSocket, wg_addr: SocketAddr) -> std::io::Result<()> {
    let udp = UdpSocket::bind(("127.0.0.1", 0)).await?;
    udp.connect(wg_addr).await?;
    tracing::debug!(
        "tunnel session open: {} -> {wg_addr}",
        udp.local_addr()?
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    let ws_to_udp = async {
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Binary(payload)) => {
                    if udp.send(&payload).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                // Pings are answered by the websocket layer; text frames
                // are not part of the protocol.
                Ok(_) => {}
            }
        }
    };

    let udp_to_ws = async {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match tokio::time::timeout(UDP_READ_DEADLINE, udp.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    if ws_tx.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                // Read error, or 30 s of silence from WireGuard.
                Ok(Err(_)) | Err(_) => break,
            }
        }
    };

    // Either pump finishing tears the session down; both sockets drop.
    tokio::select! {
        _ = ws_to_udp => {}
        _ = udp_to_ws => {}
    }
    tracing::debug!("tunnel session closed ({wg_addr})");
    Ok(())
}

/// Run the tunnel listener, with TLS when cert/key are configured.
pub async fn serve(config: Arc<TunnelConfig>) -> anyhow::Result<()> {
    let section = &config.ws_tunnel;
    let wg_addr: SocketAddr = format!("127.0.0.1:{}", config.wireguard.listen_port).parse()?;
    let app = router(wg_addr);

    let listener = TcpListener::bind(&section.listen_addr).await?;
    tracing::info!(
        "🌐 WS tunnel listening on {} (path {}, tls {})",
        section.listen_addr,
        section.path,
        section.tls_enabled()
    );

    match (&section.tls_cert, &section.tls_key) {
        (Some(cert), Some(key)) => serve_tls(listener, app, cert, key).await,
        _ => {
            axum::serve(listener, app).await?;
            Ok(())
        }
    }
}

/// TLS accept loop: rustls handshake per connection, then hand the
/// stream to hyper with upgrade support so the WebSocket handshake
/// still works.
async fn serve_tls(
    listener: TcpListener,
    app: Router,
    cert_path: &str,
    key_path: &str,
) -> anyhow::Result<()> {
    let cert_file = std::fs::File::open(cert_path)?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<rustls::pki_types::CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()?;

    let key_file = std::fs::File::open(key_path)?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {key_path}"))?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    // WebSockets ride HTTP/1.1.
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    loop {
        let (tcp_stream, remote_addr) = listener.accept().await?;
        let tls_acceptor = tls_acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("TLS handshake error from {remote_addr}: {e}");
                    return;
                }
            };

            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(
                    hyper_util::rt::TokioIo::new(tls_stream),
                    hyper::service::service_fn(move |req| {
                        tower::ServiceExt::oneshot(app.clone(), req)
                    }),
                )
                .with_upgrades()
                .await
            {
                tracing::debug!("tunnel connection error from {remote_addr}: {e}");
            }
        });
    }
}
