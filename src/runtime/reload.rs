use super::NameServerControl;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::process::Command;

/// Reloads the local name-server by running a fixed command, by default
/// `systemctl reload named`.  A command that outlives `timeout` is killed.
pub struct CommandReload {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandReload {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl NameServerControl for CommandReload {
    async fn reload(&self) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("Empty reload command"))?;
        debug!("Reloading name-server: {:?}", self.argv);

        let child = Command::new(program).args(args).kill_on_drop(true).output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", program, self.timeout))?
            .with_context(|| format!("Failed to run {}", program))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}
