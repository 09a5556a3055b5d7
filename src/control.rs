//! The control loop.
//!
//! One task, one iteration at a time: locate guests, probe them, let the
//! capacity controller decide, act, and after any action re-observe and
//! republish the zone.  Desired capacity lives only here.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::config::Config;
use crate::controller::{CapacityController, ScalePlan};
use crate::locator::GuestLocator;
use crate::prober::HealthProber;
use crate::runtime::RemoteExec;
use crate::types::{Availability, Host};
use crate::zone::ZonePublisher;

/// Pauses between and inside iterations.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub idle: Duration,
    pub scale_up_settle: Duration,
    pub scale_down_settle: Duration,
}

impl Pacing {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            idle: cfg.idle_interval(),
            scale_up_settle: cfg.scale_up_settle(),
            scale_down_settle: cfg.scale_down_settle(),
        }
    }
}

/// Commands used to act on the fleet.
#[derive(Debug, Clone)]
pub struct FleetCommands {
    pub host_username: String,
    pub guest_username: String,
    pub vm_name: String,
    pub timeout: Duration,
}

impl FleetCommands {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            host_username: cfg.host_username.clone(),
            guest_username: cfg.guest_username.clone(),
            vm_name: cfg.vm_name.clone(),
            timeout: cfg.command_timeout(),
        }
    }
}

/// What one iteration observed and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub observed: usize,
    pub plan: ScalePlan,
    pub published: Option<u64>,
}

pub struct ControlLoop {
    controller: CapacityController,
    locator: GuestLocator,
    prober: HealthProber,
    publisher: ZonePublisher,
    exec: Arc<dyn RemoteExec>,
    commands: FleetCommands,
    pacing: Pacing,
}

impl ControlLoop {
    pub fn new(
        controller: CapacityController,
        locator: GuestLocator,
        prober: HealthProber,
        publisher: ZonePublisher,
        exec: Arc<dyn RemoteExec>,
        commands: FleetCommands,
        pacing: Pacing,
    ) -> Self {
        Self {
            controller,
            locator,
            prober,
            publisher,
            exec,
            commands,
            pacing,
        }
    }

    #[cfg(test)]
    fn desired(&self) -> usize {
        self.controller.desired()
    }

    /// Run until `shutdown` flips to true.  Shutdown is only honoured
    /// between iterations or while waiting, so a zone write in progress
    /// always completes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Control loop started: {} host(s), desired capacity {}",
            self.controller.hosts().len(),
            self.controller.desired()
        );
        while !*shutdown.borrow() {
            match self.iterate(&mut shutdown).await {
                Ok(IterationReport {
                    observed,
                    plan,
                    published: Some(serial),
                }) => debug!(
                    "Acted on {} observed guest(s) with {:?}, zone serial {}",
                    observed, plan, serial
                ),
                Ok(_) => {}
                Err(e) => error!("Iteration failed: {:#}", e),
            }
            if wait(&mut shutdown, self.pacing.idle).await {
                break;
            }
        }
        info!("Control loop stopped");
    }

    /// One decision cycle.  Only a failed zone write is an error.
    pub async fn iterate(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<IterationReport> {
        let available = self.observe().await;
        if available.is_empty() {
            warn!("No proxy servers reachable");
        } else {
            info!("{} proxy server(s) online: {}", available.len(), available);
        }

        let plan = self.controller.plan(&available);
        let settle = match &plan {
            ScalePlan::Hold => None,
            ScalePlan::Start(hosts) => {
                info!(
                    "Below minimum, starting guests on {} host(s) (desired {})",
                    hosts.len(),
                    self.controller.desired()
                );
                self.start_guests(hosts).await;
                Some(self.pacing.scale_up_settle)
            }
            ScalePlan::Stop(guest) => {
                info!(
                    "Above maximum, stopping guest {} (desired {})",
                    guest,
                    self.controller.desired()
                );
                self.stop_guest(*guest).await;
                Some(self.pacing.scale_down_settle)
            }
        };
        let Some(settle) = settle else {
            return Ok(IterationReport {
                observed: available.len(),
                plan,
                published: None,
            });
        };

        // Shutdown during the settle wait still falls through to republish.
        wait(shutdown, settle).await;

        let after = self.observe().await;
        let serial = self.publisher.publish(&after).await?;
        Ok(IterationReport {
            observed: available.len(),
            plan,
            published: Some(serial),
        })
    }

    async fn observe(&self) -> Availability {
        let guests = self.locator.locate(self.controller.hosts()).await;
        self.prober.probe(guests.into_values()).await
    }

    async fn start_guests(&self, hosts: &[Host]) {
        let targets: Vec<IpAddr> = hosts.iter().map(Host::addr).collect();
        let command = format!("vboxmanage startvm {} --type headless", self.commands.vm_name);
        let results = self
            .exec
            .run(
                &command,
                &targets,
                self.commands.timeout,
                &self.commands.host_username,
            )
            .await;
        let sent = results.values().filter(|r| r.is_ok()).count();
        info!("Start request accepted by {}/{} host(s)", sent, targets.len());
    }

    async fn stop_guest(&self, guest: IpAddr) {
        // The session usually drops as the guest goes down, so failures
        // here are expected and only logged by the executor.
        self.exec
            .run(
                "shutdown now",
                &[guest],
                self.commands.timeout,
                &self.commands.guest_username,
            )
            .await;
    }
}

/// Sleep for `duration` unless shutdown is requested first.  Returns true
/// when shutdown was requested.
async fn wait(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{BatchOutput, ExecError, NameServerControl};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Pretends to be a fleet: hosts whose guest is "running" report a
    /// loopback guest address, start requests boot guests, and stop
    /// requests shut them down.
    struct FakeFleet {
        running: Mutex<HashSet<IpAddr>>,
        calls: Mutex<Vec<(String, Vec<IpAddr>, String)>>,
    }

    impl FakeFleet {
        fn new(running: &[IpAddr]) -> Arc<Self> {
            Arc::new(Self {
                running: Mutex::new(running.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    /// Host 10.0.0.n runs its guest at 127.0.0.n.
    fn guest_of(host: IpAddr) -> IpAddr {
        match host {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::new(127, 0, 0, v4.octets()[3])),
            other => other,
        }
    }

    fn host_of(guest: IpAddr) -> IpAddr {
        match guest {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::new(10, 0, 0, v4.octets()[3])),
            other => other,
        }
    }

    #[async_trait]
    impl RemoteExec for FakeFleet {
        async fn run(
            &self,
            command: &str,
            targets: &[IpAddr],
            timeout: Duration,
            login_user: &str,
        ) -> BatchOutput {
            self.calls.lock().unwrap().push((
                command.to_string(),
                targets.to_vec(),
                login_user.to_string(),
            ));
            let mut running = self.running.lock().unwrap();
            targets
                .iter()
                .map(|&t| {
                    let reply = if command.starts_with("vboxmanage guestproperty") {
                        if running.contains(&t) {
                            Ok(format!(
                                "Name: /VirtualBox/GuestInfo/Net/0/V4/IP, value: {}, timestamp: 1",
                                guest_of(t)
                            ))
                        } else {
                            Err(ExecError::Timeout(timeout))
                        }
                    } else if command.starts_with("vboxmanage startvm") {
                        running.insert(t);
                        Ok(String::new())
                    } else {
                        running.remove(&host_of(t));
                        Ok(String::new())
                    };
                    (t, reply)
                })
                .collect()
        }
    }

    struct NoopReload;

    #[async_trait]
    impl NameServerControl for NoopReload {
        async fn reload(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn hosts(n: u8) -> Vec<Host> {
        (1..=n).map(|i| Host(Ipv4Addr::new(10, 0, 0, i))).collect()
    }

    fn host_ip(i: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, i))
    }

    async fn build(
        fleet: Arc<FakeFleet>,
        server: &MockServer,
        zone_path: &std::path::Path,
        hosts: Vec<Host>,
        min: usize,
        max: usize,
    ) -> ControlLoop {
        let exec: Arc<dyn RemoteExec> = fleet;
        ControlLoop::new(
            CapacityController::new(hosts, min, max),
            GuestLocator::new(exec.clone(), "t1", "CentOS", Duration::from_secs(1)),
            HealthProber::new(Duration::from_secs(2), server.address().port()).unwrap(),
            ZonePublisher::new(
                "ddm.lan",
                "edge",
                zone_path,
                "192.168.10.2".parse().unwrap(),
                Arc::new(NoopReload),
            ),
            exec,
            FleetCommands {
                host_username: "t1".into(),
                guest_username: "root".into(),
                vm_name: "CentOS".into(),
                timeout: Duration::from_secs(1),
            },
            Pacing {
                idle: Duration::ZERO,
                scale_up_settle: Duration::ZERO,
                scale_down_settle: Duration::ZERO,
            },
        )
    }

    async fn http_server() -> MockServer {
        // wiremock binds 127.0.0.1; other loopback guests are refused on
        // the same port, which is exactly an unreachable proxy.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn steady_state_does_not_publish() {
        let server = http_server().await;
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("db.ddm.lan");
        let fleet = FakeFleet::new(&[host_ip(1)]);
        let mut ctl = build(fleet.clone(), &server, &zone, hosts(3), 1, 1).await;
        let (_tx, mut rx) = watch::channel(false);

        let report = ctl.iterate(&mut rx).await.unwrap();

        assert_eq!(report.observed, 1);
        assert_eq!(report.plan, ScalePlan::Hold);
        assert_eq!(report.published, None);
        assert_eq!(ctl.desired(), 3);
        assert!(!zone.exists());
    }

    #[tokio::test]
    async fn scale_up_starts_prefix_then_publishes() {
        let server = http_server().await;
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("db.ddm.lan");
        // Nothing is running; host 1's guest answers HTTP once started.
        let fleet = FakeFleet::new(&[]);
        let mut ctl = build(fleet.clone(), &server, &zone, hosts(3), 1, 1).await;
        let (_tx, mut rx) = watch::channel(false);

        let report = ctl.iterate(&mut rx).await.unwrap();

        assert_eq!(report.observed, 0);
        assert_eq!(report.plan, ScalePlan::Start(hosts(3)));
        assert!(report.published.is_some());

        let calls = fleet.calls.lock().unwrap();
        let (cmd, targets, user) = &calls[1];
        assert_eq!(cmd, "vboxmanage startvm CentOS --type headless");
        assert_eq!(targets, &vec![host_ip(1), host_ip(2), host_ip(3)]);
        assert_eq!(user, "t1");

        let text = std::fs::read_to_string(&zone).unwrap();
        assert!(text.contains("edge    IN  A   127.0.0.1\n"));
        assert!(!text.contains("127.0.0.2"));
    }

    #[tokio::test]
    async fn scale_down_stops_one_guest_then_publishes() {
        let server = http_server().await;
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("db.ddm.lan");
        let fleet = FakeFleet::new(&[host_ip(1)]);
        // max = 0 so the single reachable guest is one too many.
        let mut ctl = build(fleet.clone(), &server, &zone, hosts(2), 0, 0).await;
        let (_tx, mut rx) = watch::channel(false);

        let report = ctl.iterate(&mut rx).await.unwrap();

        assert_eq!(report.plan, ScalePlan::Stop("127.0.0.1".parse().unwrap()));
        assert_eq!(ctl.desired(), 1);
        {
            let calls = fleet.calls.lock().unwrap();
            let (cmd, targets, user) = &calls[1];
            assert_eq!(cmd, "shutdown now");
            assert_eq!(targets, &vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
            assert_eq!(user, "root");
        }

        let text = std::fs::read_to_string(&zone).unwrap();
        assert!(!text.contains("edge"));
    }

    #[tokio::test]
    async fn zone_write_failure_surfaces_as_error() {
        let server = http_server().await;
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("no-such-dir").join("db.ddm.lan");
        let fleet = FakeFleet::new(&[]);
        let mut ctl = build(fleet, &server, &zone, hosts(1), 1, 1).await;
        let (_tx, mut rx) = watch::channel(false);

        assert!(ctl.iterate(&mut rx).await.is_err());
        assert_eq!(ctl.desired(), 1);
    }

    #[tokio::test]
    async fn shutdown_during_settle_still_publishes() {
        let server = http_server().await;
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("db.ddm.lan");
        let fleet = FakeFleet::new(&[]);
        let mut ctl = build(fleet, &server, &zone, hosts(2), 1, 1).await;
        ctl.pacing.scale_up_settle = Duration::from_secs(3600);
        let (tx, mut rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
            // Keep the sender alive until the iteration is done.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let report = tokio::time::timeout(Duration::from_secs(10), ctl.iterate(&mut rx))
            .await
            .expect("settle wait ignored shutdown")
            .unwrap();

        assert_eq!(report.plan, ScalePlan::Start(hosts(2)));
        assert!(report.published.is_some());
        let text = std::fs::read_to_string(&zone).unwrap();
        assert!(text.contains("edge    IN  A   127.0.0.1\n"));
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let server = http_server().await;
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("db.ddm.lan");
        let fleet = FakeFleet::new(&[host_ip(1)]);
        let ctl = build(fleet, &server, &zone, hosts(1), 1, 1).await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(ctl.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_returns_early_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(wait(&mut rx, Duration::from_secs(3600)).await);

        let (_tx, mut rx) = watch::channel(false);
        assert!(!wait(&mut rx, Duration::from_millis(1)).await);
    }
}
