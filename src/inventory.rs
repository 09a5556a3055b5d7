//! Static host inventory.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Context;
use log::debug;

use crate::types::Host;

/// Read the host list once at startup: one IPv4 address per line, in
/// order.  Lines that are not an address are skipped, as are repeats.
pub async fn load(path: &Path) -> anyhow::Result<Vec<Host>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read host inventory {}", path.display()))?;
    Ok(parse(&text))
}

pub fn parse(text: &str) -> Vec<Host> {
    let mut hosts: Vec<Host> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        match line.parse::<Ipv4Addr>() {
            Ok(ip) if !hosts.contains(&Host(ip)) => hosts.push(Host(ip)),
            Ok(_) => debug!("Skipping duplicate inventory entry {}", line),
            Err(_) if line.is_empty() => {}
            Err(_) => debug!("Skipping malformed inventory line {:?}", line),
        }
    }
    hosts
}
