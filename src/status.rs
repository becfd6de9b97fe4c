use std::fmt;

use anyhow::Result;
use log::debug;

use crate::config::Config;
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerState, ServiceHealth};

/// Read-only snapshot of the lab container and its time-sync daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub container: String,
    pub state: ContainerState,
    pub service: ServiceHealth,
    pub peers: Option<String>,
}

impl StatusReport {
    pub async fn gather<R: ContainerRuntime>(runtime: &R, cfg: &Config) -> Result<Self> {
        let name = cfg.container_name.clone();
        let state = runtime.state(&name).await?;
        if state != ContainerState::Running {
            return Ok(Self {
                container: name,
                state,
                service: ServiceHealth::Unknown(format!("container is {}", state)),
                peers: None,
            });
        }

        let probe = vec!["pgrep".to_string(), "-x".to_string(), "ntpd".to_string()];
        let service = match runtime.exec(&name, &probe).await {
            Ok(out) if out.success() => ServiceHealth::Up,
            Ok(out) => {
                debug!("pgrep exited with {:?}", out.exit_code);
                ServiceHealth::Down
            }
            Err(e) => ServiceHealth::Unknown(e.to_string()),
        };

        let peers = match runtime.exec(&name, &cfg.peer_query).await {
            Ok(out) => out.output,
            Err(e) => format!("{}: {}\n", cfg.peer_query.join(" "), e),
        };

        Ok(Self {
            container: name,
            state,
            service,
            peers: Some(peers),
        })
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Container: {} ({})", self.container, self.state)?;
        writeln!(f, "NTP service: {}", self.service)?;
        if let Some(peers) = &self.peers {
            writeln!(f)?;
            writeln!(f, "Peers:")?;
            f.write_str(peers)?;
            if !peers.ends_with('\n') {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
