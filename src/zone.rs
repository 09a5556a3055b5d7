//! Zone Publisher.
//!
//! Renders the authoritative zone for the service domain from the set of
//! available guests and hands it to the name-server.  The whole file is
//! rewritten on every publish; nothing is read back.
//!
//! The new zone is written to a sibling `.tmp` file and renamed into
//! place, so the directory holding the zone must be writable.  Mode and,
//! where the process is allowed to, owner and group are carried over
//! from the file being replaced.  Other attributes such as an SELinux
//! label are not; relabel the directory's default context if needed.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::net::UdpSocket;

use crate::runtime::NameServerControl;
use crate::types::Availability;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to write zone file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct ZonePublisher {
    domain: String,
    label: String,
    path: PathBuf,
    publisher_ip: IpAddr,
    reload: Arc<dyn NameServerControl>,
    last_serial: Option<u64>,
}

impl ZonePublisher {
    pub fn new(
        domain: impl Into<String>,
        label: impl Into<String>,
        path: impl Into<PathBuf>,
        publisher_ip: IpAddr,
        reload: Arc<dyn NameServerControl>,
    ) -> Self {
        Self {
            domain: domain.into(),
            label: label.into(),
            path: path.into(),
            publisher_ip,
            reload,
            last_serial: None,
        }
    }

    /// Serial for the next publish: wall-clock seconds, bumped past the
    /// previous serial when two publishes land in the same second.
    fn next_serial(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let serial = match self.last_serial {
            Some(last) => now.max(last + 1),
            None => now,
        };
        self.last_serial = Some(serial);
        serial
    }

    /// Write the zone for `available` and ask the name-server to reload.
    ///
    /// A write failure is returned.  A reload failure is only logged:
    /// the file on disk is already correct and the next reload picks it up.
    pub async fn publish(&mut self, available: &Availability) -> Result<u64, PublishError> {
        let serial = self.next_serial();
        let zone = render(&self.domain, &self.label, self.publisher_ip, serial, available);
        write_atomic(&self.path, zone.as_bytes())
            .await
            .map_err(|source| PublishError::Write {
                path: self.path.clone(),
                source,
            })?;
        info!(
            "Published serial {} with {} record(s) to {}",
            serial,
            available.len(),
            self.path.display()
        );

        if let Err(e) = self.reload.reload().await {
            warn!("Zone written but name-server reload failed: {:#}", e);
        }
        Ok(serial)
    }
}

/// Render the zone document.  Records follow the set's address order.
pub fn render(
    domain: &str,
    label: &str,
    publisher_ip: IpAddr,
    serial: u64,
    available: &Availability,
) -> String {
    let ns_type = record_type(publisher_ip);
    let mut zone = format!(
        "$ORIGIN {domain}.
$TTL    1200
@   IN  SOA ns.{domain}.    admin.{domain}. (
        {serial}  ; Serial
        120         ; Refresh
        180         ; Retry
        7200        ; Expire
        300         ; Negative Cache TTL
)

        IN  NS  ns.{domain}.
        IN  {ns_type}   {publisher_ip}
ns      IN  {ns_type}   {publisher_ip}

"
    );

    for (i, ip) in available.iter().enumerate() {
        let owner = if i == 0 { label } else { "" };
        // Infallible for String.
        let _ = writeln!(zone, "{:<7} IN  {}   {}", owner, record_type(*ip), ip);
    }
    zone
}

fn record_type(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "A",
        IpAddr::V6(_) => "AAAA",
    }
}

/// Replace `path` in one step so the name-server never reads a partial zone.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    if let Ok(previous) = tokio::fs::metadata(path).await {
        if let Err(e) = carry_over_attributes(&previous, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Give the replacement the mode of the zone it replaces, and its owner
/// and group when permitted.  Changing ownership needs privileges the
/// daemon may not have, so that part is best effort.
async fn carry_over_attributes(previous: &std::fs::Metadata, tmp: &Path) -> std::io::Result<()> {
    tokio::fs::set_permissions(tmp, previous.permissions()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Err(e) = std::os::unix::fs::chown(tmp, Some(previous.uid()), Some(previous.gid())) {
            debug!("Keeping new zone file ownership: {}", e);
        }
    }
    Ok(())
}

/// Find the address this machine routes outbound traffic from.  No packet
/// is sent; connecting a UDP socket only selects a route.
pub async fn detect_publisher_ip() -> anyhow::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    Ok(socket.local_addr()?.ip())
}
