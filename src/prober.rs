//! Health Prober: a best-effort HTTP liveness check against every
//! candidate guest.
//!
//! Any HTTP response at all, whatever its status, means the proxy is
//! serving.  Every error is folded into [`ProbeOutcome::Unreachable`]
//! and never reaches the caller; a live node misclassified as down is
//! corrected on the next iteration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures_util::future::join_all;
use log::debug;
use reqwest::redirect::Policy;
use reqwest::Client;

use crate::types::{Availability, ProbeOutcome};

pub struct HealthProber {
    client: Client,
    port: u16,
}

impl HealthProber {
    pub fn new(timeout: Duration, port: u16) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { client, port })
    }

    pub async fn check(&self, ip: IpAddr) -> ProbeOutcome {
        let url = format!("http://{}/", SocketAddr::new(ip, self.port));
        match self.client.get(&url).send().await {
            Ok(resp) => {
                debug!("Probe {} -> {}", url, resp.status());
                ProbeOutcome::Available
            }
            Err(e) => ProbeOutcome::Unreachable(e.to_string()),
        }
    }

    /// Probe all candidates concurrently and keep the reachable ones.
    pub async fn probe<I>(&self, candidates: I) -> Availability
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let checks = candidates
            .into_iter()
            .map(|ip| async move { (ip, self.check(ip).await) });
        join_all(checks)
            .await
            .into_iter()
            .filter_map(|(ip, outcome)| match outcome {
                ProbeOutcome::Available => Some(ip),
                ProbeOutcome::Unreachable(reason) => {
                    debug!("Guest {} unreachable: {}", ip, reason);
                    None
                }
            })
            .collect()
    }
}
