//! Data structures shared by the lifecycle, collector and status code.
//!
//! The container's state is never cached: every lifecycle operation asks
//! the runtime for a fresh [`ContainerState`] and acts on that answer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Externally observed state of the lab container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// No container with the configured name exists.
    Absent,
    /// The container exists but its processes are not running.
    Stopped,
    Running,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Absent => "absent",
            ContainerState::Stopped => "stopped",
            ContainerState::Running => "running",
        };
        f.write_str(s)
    }
}

/// What `start` had to do to reach the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Created,
    Resumed,
    AlreadyRunning,
}

/// What `stop` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
    Absent,
}

/// Health of the time-sync daemon inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceHealth {
    Up,
    Down,
    Unknown(String),
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceHealth::Up => f.write_str("up"),
            ServiceHealth::Down => f.write_str("down"),
            ServiceHealth::Unknown(reason) => write!(f, "unknown ({})", reason),
        }
    }
}

/// Captured result of a command run inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    /// stdout and stderr, interleaved as they arrived.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_state_renders_lowercase() {
        assert_eq!(ContainerState::Absent.to_string(), "absent");
        assert_eq!(ContainerState::Stopped.to_string(), "stopped");
        assert_eq!(ContainerState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&ContainerState::Running).unwrap(),
            "\"running\""
        );
    }

    #[test]
    fn exec_success_needs_zero_exit() {
        let ok = ExecOutput {
            exit_code: Some(0),
            output: String::new(),
        };
        let unknown = ExecOutput::default();
        assert!(ok.success());
        assert!(!unknown.success());
    }
}
