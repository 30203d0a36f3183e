//! Shared helpers for the test modules in this crate.

use crate::auth_client::AuthClient;
use crate::config::*;
use crate::nat::NatManager;
use crate::routes::RouteManager;
use crate::state::AppState;
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use wiresocket_core::backend::BackendMode;
use wiresocket_core::proto::{VerifyRequest, VerifyResponse};
use wiresocket_core::shell::CommandRunner;
use wiresocket_core::Result;

pub const ADMIN_TOKEN: &str = "tunnel-secret";

/// An initialized in-memory database. A single connection keeps every
/// query on the same in-memory DB.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::db::init_schema(&pool).await.unwrap();
    pool
}

pub fn test_config() -> TunnelConfig {
    TunnelConfig {
        tunnel: TunnelSection {
            id: "hk-01".into(),
            name: "Hong Kong 1".into(),
            region: "ap".into(),
            token: ADMIN_TOKEN.into(),
            master_token: "master".into(),
            heartbeat_interval_secs: 30,
            cleanup_interval_secs: 30,
            peer_timeout_secs: 180,
        },
        auth: AuthSection {
            url: "http://127.0.0.1:1".into(),
        },
        server: ServerSection {
            address: "127.0.0.1:0".into(),
        },
        database: DatabaseSection {
            path: ":memory:".into(),
        },
        wireguard: WireguardSection {
            device_name: "wg0".into(),
            mode: BackendMode::Userspace,
            listen_port: 51820,
            subnet: "10.0.0.0/24".into(),
            dns: vec!["1.1.1.1".into()],
            endpoint: "hk-01.example.com:51820".into(),
            private_key: "cHJpdmF0ZQ==".into(),
            public_key: "c2VydmVyLXB1YmxpYw==".into(),
        },
        ws_tunnel: WsTunnelSection {
            enabled: true,
            listen_addr: "127.0.0.1:0".into(),
            public_host: "hk-01.example.com".into(),
            path: "/".into(),
            tls_cert: None,
            tls_key: None,
        },
    }
}

/// State wired to fakes: no WireGuard device, iptables/ip replaced by
/// [`FakeIptables`], auth client pointed at `auth_url`.
pub async fn test_state_with_auth(auth_url: &str) -> AppState {
    let fake = Arc::new(FakeIptables::default());
    AppState {
        db: memory_pool().await,
        config: Arc::new(test_config()),
        backend: None,
        auth: Arc::new(AuthClient::new(auth_url, ADMIN_TOKEN)),
        routes: Arc::new(RouteManager::new(fake.clone())),
        nat: Arc::new(NatManager::new(fake)),
        started: Instant::now(),
    }
}

// ---------------------------------------------------------------------------
// Stub auth service
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum StubVerdict {
    /// Accept every login; user ids are assigned per username.
    Valid,
    /// Reject every login with this message.
    Invalid(&'static str),
}

#[derive(Clone)]
struct StubState {
    verdict: StubVerdict,
    users: Arc<Mutex<HashMap<String, i64>>>,
}

async fn stub_verify(
    State(state): State<StubState>,
    Json(request): Json<VerifyRequest>,
) -> Json<VerifyResponse> {
    match state.verdict {
        StubVerdict::Valid => {
            let mut users = state.users.lock();
            let next = users.len() as i64 + 1;
            let id = *users.entry(request.username.clone()).or_insert(next);
            Json(VerifyResponse {
                valid: true,
                user_id: Some(id),
                username: Some(request.username),
                allowed_tunnels: vec![request.tunnel_id],
                error: None,
            })
        }
        StubVerdict::Invalid(message) => Json(VerifyResponse {
            valid: false,
            user_id: None,
            username: None,
            allowed_tunnels: Vec::new(),
            error: Some(message.to_string()),
        }),
    }
}

/// Spawn a minimal auth service answering only `/api/tunnel/verify`;
/// returns its base URL.
pub async fn spawn_stub_auth(verdict: StubVerdict) -> String {
    let state = StubState {
        verdict,
        users: Arc::new(Mutex::new(HashMap::new())),
    };
    let app = Router::new()
        .route("/api/tunnel/verify", post(stub_verify))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// Fake iptables / ip host state
// ---------------------------------------------------------------------------

/// Emulates the bits of host state the managers poke: an iptables rule
/// set keyed by `table chain args`, and a route table. `-C` succeeds
/// only for present rules, duplicate `ip route add` reports
/// "File exists", deletes of absent objects fail.
#[derive(Default)]
pub struct FakeIptables {
    commands: Mutex<Vec<String>>,
    rules: Mutex<HashSet<String>>,
    route_table: Mutex<HashSet<String>>,
    adds: Mutex<usize>,
    fail_add_markers: Mutex<Vec<String>>,
}

impl FakeIptables {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn active_rules(&self) -> Vec<String> {
        self.rules.lock().iter().cloned().collect()
    }

    pub fn add_count(&self) -> usize {
        *self.adds.lock()
    }

    /// Make `-A` invocations whose rule text contains `marker` fail.
    pub fn fail_adds_containing(&self, marker: &str) {
        self.fail_add_markers.lock().push(marker.to_string());
    }

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeIptables {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        let line = format!("{program} {}", args.join(" "));
        self.commands.lock().push(line.clone());

        match program {
            "iptables" => {
                // Shape: -t <table> <op> <chain> <rule...>
                if args.len() < 4 || args[0] != "-t" {
                    return Ok(Self::output(2, "bad arguments"));
                }
                let table = args[1];
                let op = args[2];
                let chain = args[3];
                let key = format!("{table} {chain} {}", args[4..].join(" "));
                match op {
                    "-C" => {
                        let present = self.rules.lock().contains(&key);
                        Ok(Self::output(if present { 0 } else { 1 }, ""))
                    }
                    "-A" => {
                        let fails = self
                            .fail_add_markers
                            .lock()
                            .iter()
                            .any(|m| key.contains(m.as_str()));
                        if fails {
                            return Ok(Self::output(1, "iptables: invalid rule"));
                        }
                        self.rules.lock().insert(key);
                        *self.adds.lock() += 1;
                        Ok(Self::output(0, ""))
                    }
                    "-D" => {
                        let removed = self.rules.lock().remove(&key);
                        Ok(Self::output(
                            if removed { 0 } else { 1 },
                            if removed { "" } else { "iptables: no matching rule" },
                        ))
                    }
                    _ => Ok(Self::output(2, "unsupported operation")),
                }
            }
            "ip" if args.first() == Some(&"route") => {
                let key = args[2..].join(" ");
                match args.get(1) {
                    Some(&"add") => {
                        if !self.route_table.lock().insert(key) {
                            return Ok(Self::output(2, "RTNETLINK answers: File exists"));
                        }
                        Ok(Self::output(0, ""))
                    }
                    Some(&"del") => {
                        let removed = self.route_table.lock().remove(&key);
                        Ok(Self::output(
                            if removed { 0 } else { 2 },
                            if removed { "" } else { "RTNETLINK answers: No such process" },
                        ))
                    }
                    _ => Ok(Self::output(2, "unsupported ip route operation")),
                }
            }
            "sysctl" => Ok(Self::output(0, "")),
            _ => Ok(Self::output(0, "")),
        }
    }
}
