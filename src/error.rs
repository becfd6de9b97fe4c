use std::path::PathBuf;

use thiserror::Error;

use crate::types::ContainerState;

/// Failures callers may want to tell apart. Everything else travels as
/// `anyhow::Error` carrying the container runtime's own message.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("container {name} is not running (state: {state})")]
    NotRunning { name: String, state: ContainerState },

    #[error("image build failed: {0}")]
    ImageBuild(String),

    #[error(
        "{} is written by the cron job in running container {container}; \
         stop the container or pass --log with another file",
        .path.display()
    )]
    LogInUse { path: PathBuf, container: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
