//! Guarded container lifecycle transitions.
//!
//! Each operation asks the runtime for the container's current
//! [`ContainerState`] and only issues the calls needed to reach the
//! target state, so running any of them twice is harmless.

use anyhow::{Context, Result};
use log::{debug, info};
use std::path::PathBuf;

use crate::config::Config;
use crate::error::HarnessError;
use crate::image;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::types::{ContainerState, StartOutcome, StopOutcome};

pub struct Lifecycle<'a, R> {
    runtime: &'a R,
    cfg: &'a Config,
}

impl<'a, R: ContainerRuntime> Lifecycle<'a, R> {
    pub fn new(runtime: &'a R, cfg: &'a Config) -> Self {
        Self { runtime, cfg }
    }

    fn name(&self) -> &str {
        &self.cfg.container_name
    }

    /// Remove any existing container, rebuild the image, then start.
    pub async fn build(&self) -> Result<StartOutcome> {
        println!("Removing existing container {} (if any)...", self.name());
        if self.runtime.remove(self.name()).await? {
            info!("Removed container {}", self.name());
        } else {
            debug!("No container {} to remove", self.name());
        }

        println!("Building image {}...", self.cfg.image_tag);
        let context = image::build_context(self.cfg).context("rendering build context")?;
        self.runtime
            .build_image(&self.cfg.image_tag, context)
            .await?;

        self.start().await
    }

    /// Resume a stopped container or create a new one; no-op when running.
    pub async fn start(&self) -> Result<StartOutcome> {
        let state = self.runtime.state(self.name()).await?;
        debug!("start: {} is {}", self.name(), state);

        match state {
            ContainerState::Running => {
                println!("Container {} is already running.", self.name());
                Ok(StartOutcome::AlreadyRunning)
            }
            ContainerState::Stopped => {
                println!("Resuming stopped container {}...", self.name());
                self.runtime.start(self.name()).await?;
                println!("Container {} is running.", self.name());
                Ok(StartOutcome::Resumed)
            }
            ContainerState::Absent => {
                let log_dir = self.prepare_log_dir().await?;
                println!(
                    "Creating container {} from {} (logs in {})...",
                    self.name(),
                    self.cfg.image_tag,
                    log_dir.display()
                );
                let spec = ContainerSpec::from_config(self.cfg, &log_dir.to_string_lossy());
                self.runtime.create(&spec).await?;
                self.runtime.start(self.name()).await?;
                println!("Container {} is running.", self.name());
                Ok(StartOutcome::Created)
            }
        }
    }

    /// Open an interactive shell in the running container.
    pub async fn enter(&self) -> Result<()> {
        let state = self.runtime.state(self.name()).await?;
        if state != ContainerState::Running {
            return Err(HarnessError::NotRunning {
                name: self.name().to_string(),
                state,
            }
            .into());
        }
        println!(
            "Entering {} as {} (exit the shell to detach)...",
            self.name(),
            self.cfg.user
        );
        self.runtime
            .attach_shell(self.name(), &self.cfg.user, &self.cfg.shell)
            .await
    }

    /// Stop the container; no-op when it is stopped or absent.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let state = self.runtime.state(self.name()).await?;
        debug!("stop: {} is {}", self.name(), state);

        match state {
            ContainerState::Running => {
                println!("Stopping container {}...", self.name());
                self.runtime.stop(self.name()).await?;
                println!("Container {} stopped.", self.name());
                Ok(StopOutcome::Stopped)
            }
            ContainerState::Stopped => {
                println!("Container {} is already stopped.", self.name());
                Ok(StopOutcome::AlreadyStopped)
            }
            ContainerState::Absent => {
                println!("Container {} does not exist.", self.name());
                Ok(StopOutcome::Absent)
            }
        }
    }

    /// Bind mounts need an absolute, existing host directory.
    async fn prepare_log_dir(&self) -> Result<PathBuf> {
        let dir = &self.cfg.host_log_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        tokio::fs::canonicalize(dir)
            .await
            .with_context(|| format!("resolving log directory {}", dir.display()))
    }
}
