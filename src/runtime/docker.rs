use super::{ContainerRuntime, ContainerSpec};
use crate::error::HarnessError;
use crate::types::{ContainerState, ExecOutput};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::io::Write;
use tokio::process::Command;

pub struct DockerRuntime {
    docker: Docker,
    /// CLI used for interactive sessions, which need a real TTY.
    cli: String,
    stop_timeout_secs: i64,
}

impl DockerRuntime {
    pub fn new(cli: String, stop_timeout_secs: i64) -> Result<Self> {
        Ok(Self {
            docker: Self::connect()?,
            cli,
            stop_timeout_secs,
        })
    }

    fn connect() -> Result<Docker> {
        // Unix socket on Linux, named pipe on Windows; honours DOCKER_HOST.
        Docker::connect_with_local_defaults().context("connecting to the Docker daemon")
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn state(&self, name: &str) -> Result<ContainerState> {
        match self.docker.inspect_container(name, None).await {
            Ok(detail) => {
                let running = detail
                    .state
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(if running {
                    ContainerState::Running
                } else {
                    ContainerState::Stopped
                })
            }
            Err(e) if is_status(&e, 404) => Ok(ContainerState::Absent),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()> {
        let opts = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = Box::pin(self.docker.build_image(opts, None, Some(context.into())));
        let mut stdout = std::io::stdout();
        while let Some(msg) = stream.next().await {
            let info = msg?;
            if let Some(err) = info.error {
                return Err(HarnessError::ImageBuild(err).into());
            }
            if let Some(line) = info.stream {
                stdout.write_all(line.as_bytes())?;
            } else if let Some(status) = info.status {
                writeln!(stdout, "{}", status)?;
            }
        }
        stdout.flush()?;
        info!("Built image {}", tag);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let opts = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                cap_add: if spec.cap_add.is_empty() {
                    None
                } else {
                    Some(spec.cap_add.clone())
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self.docker.create_container(Some(opts), config).await?;
        for warning in created.warnings {
            warn!("create {}: {}", spec.name, warning);
        }
        debug!("Created container {} ({})", spec.name, created.id);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let opts = StopContainerOptions {
            t: self.stop_timeout_secs,
        };
        match self.docker.stop_container(name, Some(opts)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(opts)).await {
            Ok(()) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecOutput> {
        let opts = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(name, opts).await?;

        let mut output = String::new();
        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    output.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
                }
            }
            StartExecResults::Detached => {
                return Err(anyhow!("exec in {} detached unexpectedly", name));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        debug!(
            "exec {:?} in {} exited with {:?}",
            cmd, name, inspect.exit_code
        );
        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            output,
        })
    }

    async fn attach_shell(&self, name: &str, user: &str, shell: &str) -> Result<()> {
        let status = Command::new(&self.cli)
            .args(["exec", "-it", "-u", user, name, shell])
            .status()
            .await
            .with_context(|| format!("running {} exec", self.cli))?;
        if !status.success() {
            return Err(anyhow!("{} exec exited with {}", self.cli, status));
        }
        Ok(())
    }
}
