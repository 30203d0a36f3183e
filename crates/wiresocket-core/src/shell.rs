//! External command execution
//!
//! All host programming (`ip`, `iptables`, `sysctl`, `ifconfig`,
//! `route`, `netsh`) goes through [`CommandRunner`] so the managers that
//! shell out can be exercised in tests with a recording runner. Success
//! is judged by exit code, never by parsing stdout.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::process::Output;

/// Executes an external command and returns its captured output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;
}

/// Runner backed by real processes.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| CoreError::Internal(format!("failed to spawn {program}: {e}")))
    }
}

/// Run a command and require exit code 0.
pub async fn run_ok(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<()> {
    let output = runner.run(program, args).await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(CoreError::Internal(format!(
        "{program} {} failed ({}): {}",
        args.join(" "),
        output.status,
        stderr.trim()
    )))
}

/// Run a command and report whether it exited 0.
pub async fn run_check(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<bool> {
    let output = runner.run(program, args).await?;
    Ok(output.status.success())
}

/// Whether a failed `ip`/`route` invocation only reported that the object
/// already exists. Those are expected when re-applying state.
pub fn already_exists(err: &CoreError) -> bool {
    let text = err.to_string();
    text.contains("File exists") || text.contains("RTNETLINK answers: File exists")
}

#[cfg(test)]
pub mod testing {
    //! A runner that records invocations instead of spawning processes.

    use super::*;
    use parking_lot::Mutex;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    #[derive(Default)]
    pub struct RecordingRunner {
        pub commands: Mutex<Vec<String>>,
        /// Command prefixes that should report failure (exit 1).
        pub fail_prefixes: Mutex<Vec<String>>,
    }

    impl RecordingRunner {
        pub fn recorded(&self) -> Vec<String> {
            self.commands.lock().clone()
        }

        pub fn fail_on(&self, prefix: &str) {
            self.fail_prefixes.lock().push(prefix.to_string());
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
            let line = format!("{program} {}", args.join(" "));
            let fails = self
                .fail_prefixes
                .lock()
                .iter()
                .any(|p| line.starts_with(p.as_str()));
            self.commands.lock().push(line);
            let code = if fails { 1 } else { 0 };
            Ok(Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[tokio::test]
    async fn test_recording_runner_reports_failures() {
        let runner = RecordingRunner::default();
        runner.fail_on("iptables -t nat -C");

        assert!(run_check(&runner, "iptables", &["-t", "nat", "-C", "POSTROUTING"])
            .await
            .map(|ok| !ok)
            .unwrap());
        assert!(run_ok(&runner, "iptables", &["-t", "nat", "-A", "POSTROUTING"])
            .await
            .is_ok());
        assert_eq!(runner.recorded().len(), 2);
    }
}
