use super::{BatchOutput, ExecError, RemoteExec};
use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, warn};
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Fans a command out over plain `ssh`, one child process per target.
///
/// Password-less key login to every target is assumed to be set up
/// already.
pub struct SshExec {
    program: String,
}

impl SshExec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, target: IpAddr, command: &str, timeout: Duration, user: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
            .arg("-l")
            .arg(user)
            .arg(target.to_string())
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run_one(
        &self,
        target: IpAddr,
        command: &str,
        timeout: Duration,
        user: &str,
    ) -> Result<String, ExecError> {
        let child = self.command(target, command, timeout, user).output();
        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| ExecError::Timeout(timeout))??;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ExecError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn run(
        &self,
        command: &str,
        targets: &[IpAddr],
        timeout: Duration,
        login_user: &str,
    ) -> BatchOutput {
        debug!("Running {:?} on {} target(s)", command, targets.len());
        let runs = targets.iter().map(|&target| async move {
            let result = self.run_one(target, command, timeout, login_user).await;
            if let Err(e) = &result {
                warn!("Remote command on {} failed: {}", target, e);
            }
            (target, result)
        });
        join_all(runs).await.into_iter().collect()
    }
}
