use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub mod reload;
pub mod ssh;
pub use reload::CommandReload;
pub use ssh::SshExec;

/// Why a single target in a batch produced no output.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn remote command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
}

/// Per-target result of a batch run.  Every requested target has an entry.
pub type BatchOutput = HashMap<IpAddr, std::result::Result<String, ExecError>>;

#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command` on every target concurrently as `login_user`.
    /// A failing or slow target never fails the batch; its entry holds
    /// the error instead.
    async fn run(
        &self,
        command: &str,
        targets: &[IpAddr],
        timeout: Duration,
        login_user: &str,
    ) -> BatchOutput;
}

#[async_trait]
pub trait NameServerControl: Send + Sync {
    /// Ask the name-server to pick up the freshly written zone.
    async fn reload(&self) -> Result<()>;
}
