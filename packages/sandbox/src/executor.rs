// ABOUTME: Command executor for running commands inside sandbox runtime instances
// ABOUTME: Classifies exec failures and implements best-effort service control with fallbacks

use crate::runtime::{Runtime, RuntimeError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Runtime instance not found: {0}")]
    NotFound(String),

    #[error("Command `{command}` exited with status {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i64,
        stderr: String,
    },

    #[error("Runtime error: {0}")]
    Runtime(RuntimeError),
}

impl From<RuntimeError> for ExecError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(id) => ExecError::NotFound(id),
            other => ExecError::Runtime(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Options controlling a single exec call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Allocate a tty. Output is then a single combined stream reported as stdout.
    pub tty: bool,
    /// Return a non-zero exit as a normal result instead of `CommandFailed`
    pub ignore_failure: bool,
}

impl ExecOptions {
    pub fn lenient() -> Self {
        Self {
            ignore_failure: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Init mechanisms available inside a sandbox, tried in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSystem {
    SysV,
    Systemd,
}

pub const SERVICE_STRATEGIES: [InitSystem; 2] = [InitSystem::SysV, InitSystem::Systemd];

impl InitSystem {
    fn command(&self, service: &str, action: ServiceAction) -> Vec<String> {
        match self {
            Self::SysV => vec![
                "service".to_string(),
                service.to_string(),
                action.as_str().to_string(),
            ],
            Self::Systemd => vec![
                "systemctl".to_string(),
                action.as_str().to_string(),
                service.to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    Applied(InitSystem),
    Failed,
}

impl ServiceOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, ServiceOutcome::Applied(_))
    }
}

/// Build an apt-get invocation that never prompts
pub fn apt_get<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    let mut argv = vec![
        "env".to_string(),
        "DEBIAN_FRONTEND=noninteractive".to_string(),
        "apt-get".to_string(),
    ];
    argv.extend(args.iter().map(|arg| arg.as_ref().to_string()));
    argv
}

/// Runs commands inside runtime instances through an injected runtime adapter
#[derive(Clone)]
pub struct CommandExecutor {
    runtime: Arc<dyn Runtime>,
}

impl CommandExecutor {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    /// Run `argv` inside the instance
    ///
    /// A missing instance is [`ExecError::NotFound`], a runtime API or transport
    /// failure is [`ExecError::Runtime`] and a non-zero exit is
    /// [`ExecError::CommandFailed`] unless `ignore_failure` is set.
    pub async fn exec<S: AsRef<str>>(
        &self,
        runtime_id: &str,
        argv: &[S],
        options: ExecOptions,
    ) -> Result<ExecOutput> {
        let argv: Vec<String> = argv.iter().map(|arg| arg.as_ref().to_string()).collect();
        let command = argv.join(" ");

        let raw = self
            .runtime
            .exec(runtime_id, &argv, options.tty)
            .await
            .inspect_err(|e| {
                warn!(runtime_id = %runtime_id, command = %command, error = %e, "Exec failed");
            })?;

        let output = ExecOutput {
            exit_code: raw.exit_code,
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
        };

        if !output.success() && !options.ignore_failure {
            debug!(
                runtime_id = %runtime_id,
                command = %command,
                exit_code = output.exit_code,
                "Command returned non-zero exit code"
            );
            return Err(ExecError::CommandFailed {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }

    /// Run `argv` and treat a non-zero exit as an error
    pub async fn run<S: AsRef<str>>(&self, runtime_id: &str, argv: &[S]) -> Result<ExecOutput> {
        self.exec(runtime_id, argv, ExecOptions::default()).await
    }

    /// Run a shell snippet through `sh -c`
    pub async fn shell(
        &self,
        runtime_id: &str,
        script: &str,
        options: ExecOptions,
    ) -> Result<ExecOutput> {
        self.exec(runtime_id, &["sh", "-c", script], options).await
    }

    pub async fn start_service(&self, runtime_id: &str, service: &str) -> ServiceOutcome {
        self.control_service(runtime_id, service, ServiceAction::Start)
            .await
    }

    pub async fn stop_service(&self, runtime_id: &str, service: &str) -> ServiceOutcome {
        self.control_service(runtime_id, service, ServiceAction::Stop)
            .await
    }

    pub async fn restart_service(&self, runtime_id: &str, service: &str) -> ServiceOutcome {
        self.control_service(runtime_id, service, ServiceAction::Restart)
            .await
    }

    /// Apply `action` to `service`, trying each init mechanism until one succeeds
    ///
    /// Service control is best-effort: when every mechanism fails the failure is
    /// logged and reported as [`ServiceOutcome::Failed`], never as an error.
    pub async fn control_service(
        &self,
        runtime_id: &str,
        service: &str,
        action: ServiceAction,
    ) -> ServiceOutcome {
        let mut last_error = None;

        for strategy in SERVICE_STRATEGIES {
            let argv = strategy.command(service, action);
            match self.run(runtime_id, &argv).await {
                Ok(_) => {
                    info!(
                        runtime_id = %runtime_id,
                        service = %service,
                        action = %action,
                        init = ?strategy,
                        "Service action applied"
                    );
                    return ServiceOutcome::Applied(strategy);
                }
                Err(e) => {
                    debug!(
                        runtime_id = %runtime_id,
                        service = %service,
                        init = ?strategy,
                        error = %e,
                        "Service control strategy failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        warn!(
            runtime_id = %runtime_id,
            service = %service,
            action = %action,
            error = ?last_error.map(|e| e.to_string()),
            "All service control strategies failed"
        );
        ServiceOutcome::Failed
    }

    pub async fn package_installed(&self, runtime_id: &str, package: &str) -> Result<bool> {
        let output = self
            .exec(runtime_id, &["dpkg", "-s", package], ExecOptions::lenient())
            .await?;
        Ok(output.success())
    }

    /// Install whichever of `packages` are missing, returning the ones installed
    pub async fn ensure_packages(&self, runtime_id: &str, packages: &[&str]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for package in packages {
            if !self.package_installed(runtime_id, package).await? {
                missing.push(package.to_string());
            }
        }

        if missing.is_empty() {
            return Ok(missing);
        }

        info!(runtime_id = %runtime_id, packages = ?missing, "Installing missing packages");
        self.run(runtime_id, &apt_get(&["update", "-y"])).await?;

        let mut args = vec!["install".to_string(), "-y".to_string()];
        args.extend(missing.iter().cloned());
        self.run(runtime_id, &apt_get(&args)).await?;

        Ok(missing)
    }
}
