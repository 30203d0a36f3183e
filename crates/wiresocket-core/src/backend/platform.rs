//! Host address, route, and DNS programming
//!
//! Thin wrappers over the platform tools (`ip`, `ifconfig`/`route`,
//! `netsh`). Callers decide whether a failure is fatal; route and DNS
//! programming is normally best-effort.

use crate::error::Result;
use crate::shell::{self, already_exists, CommandRunner};
use ipnet::Ipv4Net;

/// Assign `net` to `dev`, set the MTU, and bring the interface up.
pub async fn configure_address(
    runner: &dyn CommandRunner,
    dev: &str,
    net: Ipv4Net,
    mtu: u16,
) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let cidr = net.to_string();
        if let Err(e) = shell::run_ok(runner, "ip", &["addr", "add", &cidr, "dev", dev]).await {
            if !already_exists(&e) {
                return Err(e);
            }
        }
        let mtu = mtu.to_string();
        shell::run_ok(runner, "ip", &["link", "set", dev, "mtu", &mtu, "up"]).await
    }
    #[cfg(target_os = "macos")]
    {
        let addr = net.addr().to_string();
        let mask = net.netmask().to_string();
        shell::run_ok(runner, "ifconfig", &[dev, "inet", &addr, &addr, "netmask", &mask]).await?;
        let mtu = mtu.to_string();
        shell::run_ok(runner, "ifconfig", &[dev, "mtu", &mtu]).await?;
        shell::run_ok(runner, "ifconfig", &[dev, "up"]).await
    }
    #[cfg(windows)]
    {
        let _ = mtu;
        let name = format!("name={dev}");
        let addr = net.addr().to_string();
        let mask = net.netmask().to_string();
        shell::run_ok(
            runner,
            "netsh",
            &["interface", "ip", "set", "address", &name, "static", &addr, &mask],
        )
        .await
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = (runner, dev, net, mtu);
        Err(crate::error::CoreError::Internal(
            "address programming is not supported on this platform".into(),
        ))
    }
}

/// Route `cidr` through `dev`. An already-present route is not an error.
pub async fn add_route(runner: &dyn CommandRunner, cidr: &str, dev: &str) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        match shell::run_ok(runner, "ip", &["route", "add", cidr, "dev", dev]).await {
            Err(e) if !already_exists(&e) => Err(e),
            _ => Ok(()),
        }
    }
    #[cfg(target_os = "macos")]
    {
        match shell::run_ok(runner, "route", &["-n", "add", "-net", cidr, "-interface", dev]).await
        {
            Err(e) if !already_exists(&e) => Err(e),
            _ => Ok(()),
        }
    }
    #[cfg(windows)]
    {
        let _ = dev;
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| crate::error::CoreError::InvalidConfig(format!("bad CIDR {cidr}")))?;
        let network = net.network().to_string();
        let mask = net.netmask().to_string();
        shell::run_ok(runner, "route", &["add", &network, "mask", &mask, "0.0.0.0"]).await
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = (runner, cidr, dev);
        Err(crate::error::CoreError::Internal(
            "route programming is not supported on this platform".into(),
        ))
    }
}

/// Remove a route previously added with [`add_route`].
pub async fn remove_route(runner: &dyn CommandRunner, cidr: &str, dev: &str) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        shell::run_ok(runner, "ip", &["route", "del", cidr, "dev", dev]).await
    }
    #[cfg(target_os = "macos")]
    {
        let _ = dev;
        shell::run_ok(runner, "route", &["-n", "delete", "-net", cidr]).await
    }
    #[cfg(windows)]
    {
        let _ = dev;
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| crate::error::CoreError::InvalidConfig(format!("bad CIDR {cidr}")))?;
        let network = net.network().to_string();
        shell::run_ok(runner, "route", &["delete", &network]).await
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = (runner, cidr, dev);
        Err(crate::error::CoreError::Internal(
            "route programming is not supported on this platform".into(),
        ))
    }
}

/// Point the host's resolver for `dev` at `servers`. Best-effort: any
/// failure is logged and swallowed, DNS is never worth failing a
/// connection for.
pub async fn set_dns(runner: &dyn CommandRunner, dev: &str, servers: &[String]) {
    if servers.is_empty() {
        return;
    }

    #[cfg(target_os = "linux")]
    let result = {
        let mut args = vec!["dns", dev];
        args.extend(servers.iter().map(String::as_str));
        shell::run_ok(runner, "resolvectl", &args).await
    };
    #[cfg(target_os = "macos")]
    let result = {
        let mut args = vec!["-setdnsservers", dev];
        args.extend(servers.iter().map(String::as_str));
        shell::run_ok(runner, "networksetup", &args).await
    };
    #[cfg(windows)]
    let result = {
        let name = format!("name={dev}");
        shell::run_ok(
            runner,
            "netsh",
            &["interface", "ip", "set", "dns", &name, "static", &servers[0]],
        )
        .await
    };
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    let result: Result<()> = {
        let _ = (runner, dev);
        Ok(())
    };

    if let Err(e) = result {
        tracing::warn!("failed to program DNS on {dev}: {e}");
    }
}
