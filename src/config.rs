use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use hickory_proto::rr::Name;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Login user on the hypervisor hosts.
    pub host_username: String,
    /// Login user inside the proxy guests.
    pub guest_username: String,
    pub hosts_file: String,
    pub domain: String,
    /// Label under `domain` carrying the proxy A-records.
    pub service_label: String,
    pub zone_file: PathBuf,
    pub minimum_proxies: usize,
    pub maximum_proxies: usize,
    pub vm_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher_ip: Option<IpAddr>,
    pub probe_port: u16,
    pub probe_timeout_secs: u64,
    pub locate_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub reload_timeout_secs: u64,
    pub idle_interval_secs: u64,
    pub scale_up_settle_secs: u64,
    pub scale_down_settle_secs: u64,
    pub ssh_program: String,
    pub reload_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_username: "t1".into(),
            guest_username: "root".into(),
            hosts_file: "~/hosts.txt".into(),
            domain: "ddm.lan".into(),
            service_label: "edge".into(),
            zone_file: PathBuf::from("/etc/named/zones/db.ddm.lan"),
            minimum_proxies: 2,
            maximum_proxies: 2,
            vm_name: "CentOS".into(),
            publisher_ip: None,
            probe_port: 80,
            probe_timeout_secs: 5,
            locate_timeout_secs: 15,
            command_timeout_secs: 30,
            reload_timeout_secs: 30,
            idle_interval_secs: 10,
            scale_up_settle_secs: 120,
            scale_down_settle_secs: 10,
            ssh_program: "ssh".into(),
            reload_command: vec!["systemctl".into(), "reload".into(), "named".into()],
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("ddm.toml"))
                .merge(Json::file("ddm.json"))
                .merge(Env::prefixed("DDM_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Normalise the domain so templates can append the trailing dot themselves.
        let name = Name::from_ascii(&config.domain)
            .map_err(|e| anyhow::anyhow!("Invalid domain {:?}: {}", config.domain, e))?;
        if name.is_root() {
            anyhow::bail!("Invalid domain: must not be the root zone");
        }
        config.domain = name.to_ascii().trim_end_matches('.').to_string();

        Name::from_ascii(&config.service_label)
            .ok()
            .filter(|label| label.num_labels() == 1)
            .ok_or_else(|| {
                anyhow::anyhow!("Invalid service_label {:?}", config.service_label)
            })?;

        if config.minimum_proxies > config.maximum_proxies {
            anyhow::bail!(
                "minimum_proxies ({}) must not exceed maximum_proxies ({})",
                config.minimum_proxies,
                config.maximum_proxies
            );
        }
        if config.probe_timeout_secs == 0
            || config.locate_timeout_secs == 0
            || config.command_timeout_secs == 0
            || config.reload_timeout_secs == 0
        {
            anyhow::bail!("Probe, locate, command and reload timeouts must be non-zero");
        }
        if config.reload_command.is_empty() {
            anyhow::bail!("reload_command must name a program");
        }

        Ok(config)
    }

    /// Inventory path with a leading `~/` expanded against `$HOME`.
    pub fn hosts_path(&self) -> PathBuf {
        match (self.hosts_file.strip_prefix("~/"), std::env::var_os("HOME")) {
            (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
            _ => PathBuf::from(&self.hosts_file),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn locate_timeout(&self) -> Duration {
        Duration::from_secs(self.locate_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn scale_up_settle(&self) -> Duration {
        Duration::from_secs(self.scale_up_settle_secs)
    }

    pub fn scale_down_settle(&self) -> Duration {
        Duration::from_secs(self.scale_down_settle_secs)
    }
}
