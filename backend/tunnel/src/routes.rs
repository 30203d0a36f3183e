//! Server-side route programming
//!
//! Routes marked `apply_on_server` are pushed into the host routing
//! table with `ip route`. Each apply tears down the previous generation
//! first (tracked in an in-memory journal), so edits converge instead of
//! accumulating. An already-existing route counts as applied.

use crate::db::RouteRow;
use parking_lot::Mutex;
use std::sync::Arc;
use wiresocket_core::shell::{self, already_exists, CommandRunner};

#[derive(Debug, Clone)]
struct AppliedRoute {
    args: Vec<String>,
}

pub struct RouteManager {
    runner: Arc<dyn CommandRunner>,
    applied: Mutex<Vec<AppliedRoute>>,
}

fn route_args(row: &RouteRow) -> Vec<String> {
    let mut args = vec![row.cidr.clone()];
    if let Some(gateway) = &row.gateway {
        args.push("via".into());
        args.push(gateway.clone());
    }
    if let Some(device) = &row.device {
        args.push("dev".into());
        args.push(device.clone());
    }
    if let Some(metric) = row.metric {
        args.push("metric".into());
        args.push(metric.to_string());
    }
    args
}

impl RouteManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Replace the applied server routes with the enabled
    /// `apply_on_server` subset of `rows`. Returns how many routes are
    /// now in place; individual failures are warnings.
    pub async fn apply(&self, rows: &[RouteRow]) -> usize {
        self.cleanup().await;

        let mut count = 0;
        for row in rows.iter().filter(|r| r.enabled && r.apply_on_server) {
            let args = route_args(row);
            let mut full: Vec<&str> = vec!["route", "add"];
            full.extend(args.iter().map(String::as_str));
            match shell::run_ok(self.runner.as_ref(), "ip", &full).await {
                Ok(()) => {
                    self.applied.lock().push(AppliedRoute { args });
                    count += 1;
                }
                Err(e) if already_exists(&e) => {
                    // Present from a previous run; adopt it so cleanup
                    // still converges.
                    self.applied.lock().push(AppliedRoute { args });
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!("failed to apply route {}: {e}", row.cidr);
                }
            }
        }
        count
    }

    /// Delete everything this manager added, most recent first.
    pub async fn cleanup(&self) {
        let applied: Vec<AppliedRoute> = {
            let mut journal = self.applied.lock();
            journal.drain(..).rev().collect()
        };
        for route in applied {
            let mut full: Vec<&str> = vec!["route", "del"];
            full.extend(route.args.iter().map(String::as_str));
            if let Err(e) = shell::run_ok(self.runner.as_ref(), "ip", &full).await {
                tracing::warn!("failed to delete route {}: {e}", route.args.join(" "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeIptables;

    fn row(cidr: &str, apply: bool) -> RouteRow {
        RouteRow {
            id: 0,
            cidr: cidr.into(),
            gateway: None,
            device: Some("wg0".into()),
            metric: None,
            enabled: true,
            push_to_client: true,
            apply_on_server: apply,
            comment: String::new(),
        }
    }

    #[test]
    fn test_route_args_rendering() {
        let mut full = row("192.168.10.0/24", true);
        full.gateway = Some("10.0.0.1".into());
        full.metric = Some(50);
        assert_eq!(
            route_args(&full).join(" "),
            "192.168.10.0/24 via 10.0.0.1 dev wg0 metric 50"
        );
    }

    #[tokio::test]
    async fn test_apply_filters_and_journals() {
        let fake = Arc::new(FakeIptables::default());
        let manager = RouteManager::new(fake.clone());

        let rows = vec![row("10.1.0.0/16", true), row("10.2.0.0/16", false)];
        let applied = manager.apply(&rows).await;
        assert_eq!(applied, 1);

        let adds: Vec<String> = fake
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("ip route add"))
            .collect();
        assert_eq!(adds, vec!["ip route add 10.1.0.0/16 dev wg0"]);
    }

    #[tokio::test]
    async fn test_reapply_cleans_previous_generation() {
        let fake = Arc::new(FakeIptables::default());
        let manager = RouteManager::new(fake.clone());

        manager.apply(&[row("10.1.0.0/16", true)]).await;
        manager.apply(&[row("10.3.0.0/16", true)]).await;

        let commands = fake.commands();
        assert!(commands.contains(&"ip route del 10.1.0.0/16 dev wg0".to_string()));
        assert!(commands.contains(&"ip route add 10.3.0.0/16 dev wg0".to_string()));
    }
}
