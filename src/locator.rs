//! Guest Locator: asks every hypervisor host which address its proxy
//! guest currently holds.
//!
//! The address comes from the VirtualBox guest properties published by
//! the guest additions, so a guest that has not booted far enough to
//! lease an address simply has no entry.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::runtime::RemoteExec;
use crate::types::{GuestMap, Host};

pub struct GuestLocator {
    exec: Arc<dyn RemoteExec>,
    login_user: String,
    vm_name: String,
    timeout: Duration,
}

impl GuestLocator {
    pub fn new(
        exec: Arc<dyn RemoteExec>,
        login_user: impl Into<String>,
        vm_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            exec,
            login_user: login_user.into(),
            vm_name: vm_name.into(),
            timeout,
        }
    }

    /// Resolve host → guest address for every host that answers with a
    /// parseable address.  Failures only drop that host's entry.
    pub async fn locate(&self, hosts: &[Host]) -> GuestMap {
        let targets: Vec<IpAddr> = hosts.iter().map(Host::addr).collect();
        let command = format!("vboxmanage guestproperty enumerate {}", self.vm_name);
        let mut outputs = self
            .exec
            .run(&command, &targets, self.timeout, &self.login_user)
            .await;

        let mut guests = GuestMap::new();
        for host in hosts {
            match outputs.remove(&host.addr()) {
                Some(Ok(text)) => match parse_guest_ip(&text) {
                    Some(ip) => {
                        debug!("Host {} runs guest {}", host, ip);
                        guests.insert(*host, ip);
                    }
                    None => debug!("Host {} reported no guest address", host),
                },
                Some(Err(e)) => debug!("Host {} did not answer: {}", host, e),
                None => debug!("Host {} missing from batch output", host),
            }
        }
        guests
    }
}

/// Extract the guest's primary IPv4 address from
/// `vboxmanage guestproperty enumerate` output.
///
/// Handles both the legacy
/// `Name: /VirtualBox/GuestInfo/Net/0/V4/IP, value: 10.0.0.5, timestamp: ...`
/// layout and the newer `/VirtualBox/GuestInfo/Net/0/V4/IP = '10.0.0.5' @ ...`.
pub fn parse_guest_ip(output: &str) -> Option<IpAddr> {
    output
        .lines()
        .filter(|line| line.contains("/V4/IP"))
        .find_map(|line| {
            line.split(|c: char| c.is_whitespace() || c == ',' || c == '\'')
                .find_map(|token| token.parse::<IpAddr>().ok())
        })
}
