use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarnessError;

/// Reference servers polled by the lab container.
pub const DEFAULT_SERVERS: &[&str] = &[
    "140.203.204.77",
    "ntp0.cam.ac.uk",
    "ptbtime1.ptb.de",
    "time-a-g.nist.gov",
    "ntp1.tuxfamily.org",
    "ns1.anu.edu.au",
    "ntp-b3.nict.go.jp",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub container_name: String,
    pub image_tag: String,
    pub base_image: String,
    /// Non-root account created in the image and used by `enter`.
    pub user: String,
    pub shell: String,
    pub host_log_dir: PathBuf,
    pub container_log_dir: String,
    pub log_file: String,
    pub collect_interval_minutes: u32,
    pub servers: Vec<String>,
    pub peer_query: Vec<String>,
    pub stop_timeout_secs: i64,
    pub docker_cli: String,
    /// Grant SYS_TIME so ntpd may discipline the clock.
    pub adjust_clock: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            container_name: "ntp-lab".into(),
            image_tag: "ntp-lab:latest".into(),
            base_image: "ubuntu:22.04".into(),
            user: "ntpuser".into(),
            shell: "/bin/bash".into(),
            host_log_dir: PathBuf::from("ntp-logs"),
            container_log_dir: "/var/log/ntp-logs".into(),
            log_file: "ntplog.txt".into(),
            collect_interval_minutes: 20,
            servers: DEFAULT_SERVERS.iter().map(|s| s.to_string()).collect(),
            peer_query: vec!["ntpq".into(), "-p".into()],
            stop_timeout_secs: 10,
            docker_cli: "docker".into(),
            adjust_clock: true,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let toml = path.unwrap_or_else(|| Path::new("ntpwatch.toml"));
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(toml))
            .merge(Json::file("ntpwatch.json"))
            .merge(Env::prefixed("NTPWATCH_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if !(1..=59).contains(&self.collect_interval_minutes) {
            return Err(HarnessError::InvalidConfig(format!(
                "collect_interval_minutes must be within 1..=59, got {}",
                self.collect_interval_minutes
            )));
        }
        if self.servers.is_empty() {
            return Err(HarnessError::InvalidConfig(
                "at least one NTP server is required".into(),
            ));
        }
        if self.peer_query.is_empty() {
            return Err(HarnessError::InvalidConfig(
                "peer_query must name a command".into(),
            ));
        }
        if !self.container_log_dir.starts_with('/') {
            return Err(HarnessError::InvalidConfig(format!(
                "container_log_dir must be absolute, got {}",
                self.container_log_dir
            )));
        }
        Ok(())
    }

    /// Host-side path of the collected log.
    pub fn log_path(&self) -> PathBuf {
        self.host_log_dir.join(&self.log_file)
    }

    /// Path of the same log as seen from inside the container.
    pub fn container_log_path(&self) -> String {
        format!(
            "{}/{}",
            self.container_log_dir.trim_end_matches('/'),
            self.log_file
        )
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.collect_interval_minutes) * 60)
    }
}
