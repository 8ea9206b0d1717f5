// ABOUTME: Runtime adapter trait and implementations for sandbox container backends
// ABOUTME: Defines the abstract interface for instance lifecycle, file transfer and exec

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerRuntime;

/// Label attached to every runtime instance created by the panel
pub const MANAGED_LABEL: &str = "sbpanel.managed";
/// Label carrying the persisted sandbox id
pub const SANDBOX_ID_LABEL: &str = "sbpanel.sandbox_id";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Runtime instance not found: {0}")]
    NotFound(String),

    #[error("Runtime conflict: {0}")]
    Conflict(String),

    #[error("Runtime API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Runtime transport error: {0}")]
    Transport(String),

    #[error("Archive error: {0}")]
    Archive(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything the runtime needs to materialize a sandbox instance
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    /// Advisory only: most runtimes cannot enforce a disk quota per instance
    pub disk_mb: u64,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl InstanceState {
    pub fn is_live(&self) -> bool {
        matches!(self, InstanceState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

/// Summary of a panel-managed instance as reported by the runtime
#[derive(Debug, Clone)]
pub struct InstanceSummary {
    pub runtime_id: String,
    pub name: String,
    pub state: InstanceState,
    pub sandbox_id: Option<i64>,
}

/// Raw result of a command run inside an instance
#[derive(Debug, Clone, Default)]
pub struct RawExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runtime adapter for sandbox backends
///
/// Implementations never swallow failures: a missing instance is reported as
/// [`RuntimeError::NotFound`], an error answer from the runtime as
/// [`RuntimeError::Api`] and a broken connection as [`RuntimeError::Transport`].
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Check that the runtime daemon is reachable
    async fn ping(&self) -> Result<()>;

    /// Create and start an instance, returning its runtime id
    async fn create(&self, spec: &InstanceSpec) -> Result<String>;

    async fn start(&self, runtime_id: &str) -> Result<()>;

    async fn stop(&self, runtime_id: &str) -> Result<()>;

    async fn restart(&self, runtime_id: &str) -> Result<()>;

    /// Remove an instance, stopping it first when `force` is set
    async fn remove(&self, runtime_id: &str, force: bool) -> Result<()>;

    async fn state(&self, runtime_id: &str) -> Result<InstanceState>;

    /// Current network address of the instance, if it has one
    async fn address(&self, runtime_id: &str) -> Result<Option<String>>;

    /// Write `contents` to `remote_path` inside the instance
    async fn copy_in(&self, runtime_id: &str, contents: &[u8], remote_path: &str) -> Result<()>;

    /// Read the file at `remote_path` out of the instance
    async fn copy_out(&self, runtime_id: &str, remote_path: &str) -> Result<Vec<u8>>;

    /// Run `argv` inside the instance. With `tty` set stdout and stderr arrive combined.
    async fn exec(&self, runtime_id: &str, argv: &[String], tty: bool) -> Result<RawExecOutput>;

    /// List every instance carrying the panel's management label
    async fn list_managed(&self) -> Result<Vec<InstanceSummary>>;
}
