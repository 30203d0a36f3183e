//! iptables NAT management
//!
//! Rules are idempotent: every rule is probed with `-C` before `-A`, so
//! re-applying a rule set never duplicates entries. Cleanup replays the
//! applied journal in reverse with `-D`. A failing rule is logged and
//! skipped; the apply as a whole still succeeds.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use wiresocket_core::shell::{self, CommandRunner};
use wiresocket_core::Result;

/// One NAT rule, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NatRule {
    Masquerade {
        out_interface: String,
    },
    Snat {
        source: String,
        #[serde(default)]
        destination: Option<String>,
        out_interface: String,
        to_source: String,
    },
    Dnat {
        in_interface: String,
        protocol: String,
        port: u16,
        to_destination: String,
    },
    Tcpmss {
        out_interface: String,
        source: String,
        mss: u16,
    },
}

impl NatRule {
    pub fn table(&self) -> &'static str {
        match self {
            NatRule::Tcpmss { .. } => "mangle",
            _ => "nat",
        }
    }

    pub fn chain(&self) -> &'static str {
        match self {
            NatRule::Dnat { .. } => "PREROUTING",
            _ => "POSTROUTING",
        }
    }

    /// The match/target arguments, identical for `-C`, `-A`, and `-D`.
    pub fn args(&self) -> Vec<String> {
        let s = |v: &str| v.to_string();
        match self {
            NatRule::Masquerade { out_interface } => {
                vec![s("-o"), s(out_interface), s("-j"), s("MASQUERADE")]
            }
            NatRule::Snat {
                source,
                destination,
                out_interface,
                to_source,
            } => {
                let mut args = vec![s("-s"), s(source)];
                if let Some(destination) = destination {
                    args.extend([s("-d"), s(destination)]);
                }
                args.extend([
                    s("-o"),
                    s(out_interface),
                    s("-j"),
                    s("SNAT"),
                    s("--to-source"),
                    s(to_source),
                ]);
                args
            }
            NatRule::Dnat {
                in_interface,
                protocol,
                port,
                to_destination,
            } => vec![
                s("-i"),
                s(in_interface),
                s("-p"),
                s(protocol),
                s("--dport"),
                port.to_string(),
                s("-j"),
                s("DNAT"),
                s("--to-destination"),
                s(to_destination),
            ],
            NatRule::Tcpmss {
                out_interface,
                source,
                mss,
            } => vec![
                s("-o"),
                s(out_interface),
                s("-s"),
                s(source),
                s("-p"),
                s("tcp"),
                s("--tcp-flags"),
                s("SYN,RST"),
                s("SYN"),
                s("-j"),
                s("TCPMSS"),
                s("--set-mss"),
                mss.to_string(),
            ],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NatRule::Masquerade { .. } => "masquerade",
            NatRule::Snat { .. } => "snat",
            NatRule::Dnat { .. } => "dnat",
            NatRule::Tcpmss { .. } => "tcpmss",
        }
    }
}

/// A nat_rules row materialized into a typed rule.
#[derive(Debug, Clone, Serialize)]
pub struct NatRuleRow {
    pub id: i64,
    #[serde(flatten)]
    pub rule: NatRule,
    pub enabled: bool,
    pub comment: String,
}

/// Load and type all NAT rules; rows with an unknown type are skipped
/// with a warning rather than poisoning the whole set.
pub async fn load_rules(pool: &SqlitePool) -> sqlx::Result<Vec<NatRuleRow>> {
    let rows = sqlx::query(
        "SELECT id, rule_type, out_interface, in_interface, source, destination, to_address,
                protocol, port, mss, enabled, comment
         FROM nat_rules ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    let mut rules = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: i64 = row.get("id");
        let rule_type: String = row.get("rule_type");
        let rule = match rule_type.as_str() {
            "masquerade" => NatRule::Masquerade {
                out_interface: row.get("out_interface"),
            },
            "snat" => NatRule::Snat {
                source: row.get("source"),
                destination: {
                    let d: String = row.get("destination");
                    (!d.is_empty()).then_some(d)
                },
                out_interface: row.get("out_interface"),
                to_source: row.get("to_address"),
            },
            "dnat" => NatRule::Dnat {
                in_interface: row.get("in_interface"),
                protocol: row.get("protocol"),
                port: row.get::<Option<i64>, _>("port").unwrap_or(0) as u16,
                to_destination: row.get("to_address"),
            },
            "tcpmss" => NatRule::Tcpmss {
                out_interface: row.get("out_interface"),
                source: row.get("source"),
                mss: row.get::<Option<i64>, _>("mss").unwrap_or(0) as u16,
            },
            other => {
                tracing::warn!("skipping nat rule {id} with unknown type '{other}'");
                continue;
            }
        };
        rules.push(NatRuleRow {
            id,
            rule,
            enabled: row.get::<i64, _>("enabled") != 0,
            comment: row.get("comment"),
        });
    }
    Ok(rules)
}

/// Insert a typed rule as a row; returns the new id.
pub async fn insert_rule(
    pool: &SqlitePool,
    rule: &NatRule,
    enabled: bool,
    comment: &str,
) -> sqlx::Result<i64> {
    let (out_if, in_if, source, destination, to_address, protocol, port, mss) = match rule {
        NatRule::Masquerade { out_interface } => {
            (out_interface.as_str(), "", "", "", "", "", None, None)
        }
        NatRule::Snat {
            source,
            destination,
            out_interface,
            to_source,
        } => (
            out_interface.as_str(),
            "",
            source.as_str(),
            destination.as_deref().unwrap_or(""),
            to_source.as_str(),
            "",
            None,
            None,
        ),
        NatRule::Dnat {
            in_interface,
            protocol,
            port,
            to_destination,
        } => (
            "",
            in_interface.as_str(),
            "",
            "",
            to_destination.as_str(),
            protocol.as_str(),
            Some(*port as i64),
            None,
        ),
        NatRule::Tcpmss {
            out_interface,
            source,
            mss,
        } => (
            out_interface.as_str(),
            "",
            source.as_str(),
            "",
            "",
            "",
            None,
            Some(*mss as i64),
        ),
    };

    let done = sqlx::query(
        "INSERT INTO nat_rules (rule_type, out_interface, in_interface, source, destination,
                                to_address, protocol, port, mss, enabled, comment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )
    .bind(rule.kind())
    .bind(out_if)
    .bind(in_if)
    .bind(source)
    .bind(destination)
    .bind(to_address)
    .bind(protocol)
    .bind(port)
    .bind(mss)
    .bind(enabled as i64)
    .bind(comment)
    .execute(pool)
    .await?;
    Ok(done.last_insert_rowid())
}

#[derive(Debug, Clone)]
struct AppliedRule {
    table: &'static str,
    chain: &'static str,
    args: Vec<String>,
}

/// Applies NAT rules to the host and journals what it added so cleanup
/// can undo exactly that, in reverse.
pub struct NatManager {
    runner: Arc<dyn CommandRunner>,
    applied: Mutex<Vec<AppliedRule>>,
}

impl NatManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Apply every enabled rule; returns how many `-A` calls were made.
    pub async fn apply(&self, rules: &[NatRule]) -> Result<usize> {
        // NAT without forwarding is a black hole.
        if let Err(e) = shell::run_ok(
            self.runner.as_ref(),
            "sysctl",
            &["-w", "net.ipv4.ip_forward=1"],
        )
        .await
        {
            tracing::warn!("could not enable IPv4 forwarding: {e}");
        }

        let mut added = 0;
        for rule in rules {
            let args = rule.args();
            let exists = self
                .probe(rule.table(), rule.chain(), "-C", &args)
                .await
                .unwrap_or(false);
            if exists {
                tracing::debug!("nat rule already present, skipping: {}", args.join(" "));
                continue;
            }
            match self.invoke(rule.table(), rule.chain(), "-A", &args).await {
                Ok(()) => {
                    self.applied.lock().push(AppliedRule {
                        table: rule.table(),
                        chain: rule.chain(),
                        args,
                    });
                    added += 1;
                }
                Err(e) => {
                    tracing::warn!("skipping nat rule ({e}): {}", args.join(" "));
                }
            }
        }
        Ok(added)
    }

    /// Delete every journaled rule in reverse order.
    pub async fn cleanup(&self) {
        let applied: Vec<AppliedRule> = {
            let mut journal = self.applied.lock();
            journal.drain(..).rev().collect()
        };
        for rule in applied {
            if let Err(e) = self.invoke(rule.table, rule.chain, "-D", &rule.args).await {
                tracing::warn!("failed to delete nat rule ({e}): {}", rule.args.join(" "));
            }
        }
    }

    /// Replace the active rule set: tear down the previous generation,
    /// then apply the new one.
    pub async fn resync(&self, rules: &[NatRule]) -> Result<usize> {
        self.cleanup().await;
        self.apply(rules).await
    }

    async fn probe(&self, table: &str, chain: &str, op: &str, args: &[String]) -> Result<bool> {
        let mut full: Vec<&str> = vec!["-t", table, op, chain];
        full.extend(args.iter().map(String::as_str));
        shell::run_check(self.runner.as_ref(), "iptables", &full).await
    }

    async fn invoke(&self, table: &str, chain: &str, op: &str, args: &[String]) -> Result<()> {
        let mut full: Vec<&str> = vec!["-t", table, op, chain];
        full.extend(args.iter().map(String::as_str));
        shell::run_ok(self.runner.as_ref(), "iptables", &full).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{memory_pool, FakeIptables};

    fn sample_rules() -> Vec<NatRule> {
        vec![
            NatRule::Masquerade {
                out_interface: "eth0".into(),
            },
            NatRule::Tcpmss {
                out_interface: "wg0".into(),
                source: "10.0.0.0/24".into(),
                mss: 1360,
            },
        ]
    }

    #[test]
    fn test_rendering_matches_iptables_grammar() {
        let masq = NatRule::Masquerade {
            out_interface: "eth0".into(),
        };
        assert_eq!(masq.table(), "nat");
        assert_eq!(masq.chain(), "POSTROUTING");
        assert_eq!(masq.args().join(" "), "-o eth0 -j MASQUERADE");

        let dnat = NatRule::Dnat {
            in_interface: "eth0".into(),
            protocol: "tcp".into(),
            port: 8443,
            to_destination: "10.0.0.2:443".into(),
        };
        assert_eq!(dnat.chain(), "PREROUTING");
        assert_eq!(
            dnat.args().join(" "),
            "-i eth0 -p tcp --dport 8443 -j DNAT --to-destination 10.0.0.2:443"
        );

        let mss = NatRule::Tcpmss {
            out_interface: "wg0".into(),
            source: "10.0.0.0/24".into(),
            mss: 1360,
        };
        assert_eq!(mss.table(), "mangle");
        assert_eq!(
            mss.args().join(" "),
            "-o wg0 -s 10.0.0.0/24 -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --set-mss 1360"
        );
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let fake = Arc::new(FakeIptables::default());
        let manager = NatManager::new(fake.clone());

        let first = manager.apply(&sample_rules()).await.unwrap();
        assert_eq!(first, 2);

        // Second apply: every -C probe succeeds, zero -A calls.
        let second = manager.apply(&sample_rules()).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(fake.add_count(), 2);
        assert_eq!(fake.active_rules().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_removes_applied_rules() {
        let fake = Arc::new(FakeIptables::default());
        let manager = NatManager::new(fake.clone());
        manager.apply(&sample_rules()).await.unwrap();
        manager.cleanup().await;
        assert!(fake.active_rules().is_empty());
    }

    #[tokio::test]
    async fn test_failing_rule_is_skipped_not_fatal() {
        let fake = Arc::new(FakeIptables::default());
        fake.fail_adds_containing("MASQUERADE");
        let manager = NatManager::new(fake.clone());

        let added = manager.apply(&sample_rules()).await.unwrap();
        assert_eq!(added, 1);
        assert_eq!(fake.active_rules().len(), 1);
    }

    #[tokio::test]
    async fn test_rule_row_round_trip() {
        let pool = memory_pool().await;
        for rule in sample_rules() {
            insert_rule(&pool, &rule, true, "test").await.unwrap();
        }
        let rows = load_rules(&pool).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows.iter().map(|r| r.rule.clone()).collect::<Vec<_>>(),
            sample_rules()
        );
        assert!(rows.iter().all(|r| r.enabled));
    }

    #[test]
    fn test_rule_json_tagging() {
        let rule: NatRule = serde_json::from_str(
            r#"{"type":"snat","source":"10.0.0.0/24","out_interface":"eth0","to_source":"203.0.113.1"}"#,
        )
        .unwrap();
        assert_eq!(rule.kind(), "snat");
        assert!(rule.args().join(" ").contains("--to-source 203.0.113.1"));
    }
}
