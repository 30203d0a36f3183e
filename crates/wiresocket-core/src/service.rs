//! Platform service integration
//!
//! `--service install|uninstall|start|stop|restart` for the three
//! daemons. Linux gets a real systemd unit; other platforms are
//! best-effort and report what they cannot do.

use crate::error::{CoreError, Result};
use crate::shell::{self, SystemRunner};

/// Parsed `--service` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Install,
    Uninstall,
    Start,
    Stop,
    Restart,
}

impl std::str::FromStr for ServiceAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "install" => Ok(Self::Install),
            "uninstall" => Ok(Self::Uninstall),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            other => Err(CoreError::InvalidConfig(format!(
                "unknown service action '{other}'"
            ))),
        }
    }
}

/// Apply a service action for the named daemon. `exec_args` is the
/// command line the service should run (absolute binary path first).
pub async fn run_action(name: &str, description: &str, exec_args: &[String], action: ServiceAction) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let runner = SystemRunner;
        let unit_path = format!("/etc/systemd/system/{name}.service");
        match action {
            ServiceAction::Install => {
                let unit = format!(
                    "[Unit]\nDescription={description}\nAfter=network-online.target\n\n\
                     [Service]\nType=simple\nExecStart={}\nRestart=on-failure\nRestartSec=5\n\n\
                     [Install]\nWantedBy=multi-user.target\n",
                    exec_args.join(" ")
                );
                std::fs::write(&unit_path, unit)
                    .map_err(|e| CoreError::Internal(format!("cannot write {unit_path}: {e}")))?;
                shell::run_ok(&runner, "systemctl", &["daemon-reload"]).await?;
                shell::run_ok(&runner, "systemctl", &["enable", name]).await?;
                tracing::info!("installed systemd unit {unit_path}");
                Ok(())
            }
            ServiceAction::Uninstall => {
                let _ = shell::run_ok(&runner, "systemctl", &["disable", "--now", name]).await;
                std::fs::remove_file(&unit_path).ok();
                shell::run_ok(&runner, "systemctl", &["daemon-reload"]).await
            }
            ServiceAction::Start => shell::run_ok(&runner, "systemctl", &["start", name]).await,
            ServiceAction::Stop => shell::run_ok(&runner, "systemctl", &["stop", name]).await,
            ServiceAction::Restart => shell::run_ok(&runner, "systemctl", &["restart", name]).await,
        }
    }
    #[cfg(target_os = "macos")]
    {
        let _ = (description, exec_args);
        let runner = SystemRunner;
        let label = format!("com.wiresocket.{name}");
        match action {
            ServiceAction::Start => {
                shell::run_ok(&runner, "launchctl", &["start", &label]).await
            }
            ServiceAction::Stop => shell::run_ok(&runner, "launchctl", &["stop", &label]).await,
            _ => Err(CoreError::Internal(
                "launchd plist installation must be done by the installer package".into(),
            )),
        }
    }
    #[cfg(windows)]
    {
        let _ = description;
        let runner = SystemRunner;
        match action {
            ServiceAction::Install => {
                let bin = format!("binPath={}", exec_args.join(" "));
                shell::run_ok(&runner, "sc", &["create", name, &bin, "start=auto"]).await
            }
            ServiceAction::Uninstall => shell::run_ok(&runner, "sc", &["delete", name]).await,
            ServiceAction::Start => shell::run_ok(&runner, "sc", &["start", name]).await,
            ServiceAction::Stop => shell::run_ok(&runner, "sc", &["stop", name]).await,
            ServiceAction::Restart => {
                let _ = shell::run_ok(&runner, "sc", &["stop", name]).await;
                shell::run_ok(&runner, "sc", &["start", name]).await
            }
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = (name, description, exec_args, action);
        Err(CoreError::Internal(
            "service management is not supported on this platform".into(),
        ))
    }
}
