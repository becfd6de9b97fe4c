use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::types::{ContainerState, ExecOutput};

pub mod docker;
pub use docker::DockerRuntime;

/// Everything needed to create the lab container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    pub cap_add: Vec<String>,
}

impl ContainerSpec {
    /// Builds the spec for `cfg`, mounting the (already absolute) host log dir.
    pub fn from_config(cfg: &Config, host_log_dir: &str) -> Self {
        let cap_add = if cfg.adjust_clock {
            vec!["SYS_TIME".to_string()]
        } else {
            Vec::new()
        };
        Self {
            name: cfg.container_name.clone(),
            image: cfg.image_tag.clone(),
            binds: vec![format!("{}:{}", host_log_dir, cfg.container_log_dir)],
            cap_add,
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Current state of the named container.
    async fn state(&self, name: &str) -> Result<ContainerState>;

    /// Build `tag` from an in-memory tar of the build context.
    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()>;

    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Force-remove the container. Returns `false` if it did not exist.
    async fn remove(&self, name: &str) -> Result<bool>;

    async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Hand the caller's terminal to a shell inside the container.
    async fn attach_shell(&self, name: &str, user: &str, shell: &str) -> Result<()>;
}
