// ABOUTME: Docker runtime adapter for local container-based sandboxes
// ABOUTME: Uses the bollard library to manage containers, file transfer and exec

use super::{
    InstanceSpec, InstanceState, InstanceSummary, RawExecOutput, Result, Runtime, RuntimeError,
    MANAGED_LABEL, SANDBOX_ID_LABEL,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
        LogOutput, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
        StopContainerOptions, UploadToContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(600);

pub struct DockerRuntime {
    client: Docker,
    /// Grace period given to an instance before it is killed on stop/restart
    stop_timeout: Duration,
    /// Timeout for image pull operations
    pull_timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using the environment defaults
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Transport(format!("Docker connection failed: {}", e)))?;
        Ok(Self::with_client(client))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Convert an instance spec to a bollard container config
    fn instance_config(spec: &InstanceSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let host_config = bollard::models::HostConfig {
            nano_cpus: Some(i64::from(spec.cpu_cores) * 1_000_000_000),
            memory: Some(memory_bytes(spec.memory_mb)),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn convert_state(state: &str) -> InstanceState {
        match state {
            "created" => InstanceState::Created,
            "running" => InstanceState::Running,
            "paused" => InstanceState::Paused,
            "restarting" => InstanceState::Restarting,
            "exited" => InstanceState::Exited,
            "dead" => InstanceState::Dead,
            _ => InstanceState::Unknown,
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error(image, e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, timeout = ?self.pull_timeout, "Pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            while let Some(progress) = stream.next().await {
                let progress = progress.map_err(|e| map_error(image, e))?;
                if let Some(error) = progress.error {
                    return Err(RuntimeError::Api {
                        status: 500,
                        message: format!("Failed to pull image {}: {}", image, error),
                    });
                }
                if let Some(status) = progress.status {
                    debug!(image = %image, "Pull status: {}", status);
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Transport(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn name_in_use(&self, name: &str) -> Result<bool> {
        match self.client.inspect_container(name, None).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error(name, e)),
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_error("daemon", e))
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<String> {
        info!(name = %spec.name, image = %spec.image, "Creating runtime instance");

        if self.name_in_use(&spec.name).await? {
            return Err(RuntimeError::Conflict(format!(
                "instance name {} already exists",
                spec.name
            )));
        }

        if !self.image_exists(&spec.image).await? {
            self.pull_image(&spec.image).await?;
        }

        if spec.disk_mb > 0 {
            warn!(
                name = %spec.name,
                disk_mb = spec.disk_mb,
                "Disk limit is advisory and not enforced by the Docker runtime"
            );
        }

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), Self::instance_config(spec))
            .await
            .map_err(|e| map_error(&spec.name, e))?;

        debug!(name = %spec.name, runtime_id = %container.id, "Created container");

        if let Err(e) = self.start(&container.id).await {
            // Don't leave a created-but-unstarted container holding the name
            if let Err(remove_err) = self.remove(&container.id, true).await {
                warn!(
                    runtime_id = %container.id,
                    error = %remove_err,
                    "Failed to remove container after start failure"
                );
            }
            return Err(e);
        }

        Ok(container.id)
    }

    async fn start(&self, runtime_id: &str) -> Result<()> {
        info!(runtime_id = %runtime_id, "Starting container");

        self.client
            .start_container(runtime_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error(runtime_id, e))
    }

    async fn stop(&self, runtime_id: &str) -> Result<()> {
        info!(runtime_id = %runtime_id, timeout = ?self.stop_timeout, "Stopping container");

        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };

        self.client
            .stop_container(runtime_id, Some(options))
            .await
            .map_err(|e| map_error(runtime_id, e))
    }

    async fn restart(&self, runtime_id: &str) -> Result<()> {
        info!(runtime_id = %runtime_id, "Restarting container");

        let options = RestartContainerOptions {
            t: self.stop_timeout.as_secs() as isize,
        };

        self.client
            .restart_container(runtime_id, Some(options))
            .await
            .map_err(|e| map_error(runtime_id, e))
    }

    async fn remove(&self, runtime_id: &str, force: bool) -> Result<()> {
        info!(runtime_id = %runtime_id, force, "Removing container");

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(runtime_id, Some(options))
            .await
            .map_err(|e| map_error(runtime_id, e))
    }

    async fn state(&self, runtime_id: &str) -> Result<InstanceState> {
        let inspect = self
            .client
            .inspect_container(runtime_id, None)
            .await
            .map_err(|e| map_error(runtime_id, e))?;

        Ok(inspect
            .state
            .and_then(|state| state.status)
            .map(|status| Self::convert_state(status.as_ref()))
            .unwrap_or(InstanceState::Unknown))
    }

    async fn address(&self, runtime_id: &str) -> Result<Option<String>> {
        let inspect = self
            .client
            .inspect_container(runtime_id, None)
            .await
            .map_err(|e| map_error(runtime_id, e))?;

        let Some(settings) = inspect.network_settings else {
            return Ok(None);
        };

        let from_networks = settings.networks.as_ref().and_then(|networks| {
            networks
                .values()
                .filter_map(|endpoint| endpoint.ip_address.clone())
                .find(|ip| !ip.is_empty())
        });

        Ok(from_networks.or_else(|| settings.ip_address.filter(|ip| !ip.is_empty())))
    }

    async fn copy_in(&self, runtime_id: &str, contents: &[u8], remote_path: &str) -> Result<()> {
        let (parent, file_name) = split_remote_path(remote_path)?;
        debug!(
            runtime_id = %runtime_id,
            path = %remote_path,
            bytes = contents.len(),
            "Copying file into container"
        );

        let archive = pack_single_file(&file_name, contents)
            .map_err(|e| RuntimeError::Archive(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: parent,
            ..Default::default()
        };

        self.client
            .upload_to_container(runtime_id, Some(options), archive.into())
            .await
            .map_err(|e| map_error(runtime_id, e))
    }

    async fn copy_out(&self, runtime_id: &str, remote_path: &str) -> Result<Vec<u8>> {
        let (_, file_name) = split_remote_path(remote_path)?;
        debug!(runtime_id = %runtime_id, path = %remote_path, "Copying file out of container");

        let options = DownloadFromContainerOptions {
            path: remote_path.to_string(),
        };
        let mut stream = self
            .client
            .download_from_container(runtime_id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| map_error(runtime_id, e))?;
            data.extend_from_slice(&bytes);
        }

        unpack_single_file(&data, &file_name).map_err(|e| RuntimeError::Archive(e.to_string()))
    }

    async fn exec(&self, runtime_id: &str, argv: &[String], tty: bool) -> Result<RawExecOutput> {
        debug!(runtime_id = %runtime_id, command = ?argv, tty, "Executing command");

        let exec_config = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(tty),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(runtime_id, exec_config)
            .await
            .map_err(|e| map_error(runtime_id, e))?;

        let start_options = StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        };
        let start_result = self
            .client
            .start_exec(&exec.id, Some(start_options))
            .await
            .map_err(|e| map_error(runtime_id, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg.map_err(|e| map_error(runtime_id, e))? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::Console { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Api {
                    status: 500,
                    message: "Exec was detached unexpectedly".to_string(),
                })
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_error(runtime_id, e))?;

        let exit_code = exec_inspect.exit_code.ok_or_else(|| RuntimeError::Api {
            status: 500,
            message: format!("Exec {} finished without an exit code", exec.id),
        })?;

        Ok(RawExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn list_managed(&self) -> Result<Vec<InstanceSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| map_error("list", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let runtime_id = container.id?;
                let name = container
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| runtime_id.clone());
                let sandbox_id = container
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(SANDBOX_ID_LABEL))
                    .and_then(|id| id.parse().ok());
                let state = container
                    .state
                    .as_deref()
                    .map(Self::convert_state)
                    .unwrap_or(InstanceState::Unknown);

                Some(InstanceSummary {
                    runtime_id,
                    name,
                    state,
                    sandbox_id,
                })
            })
            .collect())
    }
}

/// Map a bollard error onto the adapter taxonomy
fn map_error(target: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(target.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            message,
        },
        other => RuntimeError::Transport(other.to_string()),
    }
}

fn split_remote_path(remote_path: &str) -> Result<(String, String)> {
    let path = Path::new(remote_path);
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RuntimeError::Archive(format!("Invalid remote path: {}", remote_path)))?;
    let parent = path
        .parent()
        .and_then(|parent| parent.to_str())
        .filter(|parent| !parent.is_empty())
        .unwrap_or("/");

    Ok((parent.to_string(), file_name.to_string()))
}

// Helper functions for tar operations
fn pack_single_file(file_name: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    use tar::{Builder, Header};

    let mut header = Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

    let mut archive = Builder::new(Vec::new());
    archive.append_data(&mut header, file_name, contents)?;
    archive.into_inner()
}

fn unpack_single_file(data: &[u8], file_name: &str) -> std::io::Result<Vec<u8>> {
    use tar::Archive;

    let mut archive = Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let matches = entry.header().entry_type().is_file()
            && entry
                .path()?
                .file_name()
                .map(|name| name == file_name)
                .unwrap_or(false);

        if matches {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} not present in archive", file_name),
    ))
}

/// Memory limit in bytes, saturating at the largest value Docker accepts
fn memory_bytes(memory_mb: u64) -> i64 {
    i64::try_from(memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeouts_overrides_defaults() {
        // Building the client does not contact the daemon
        let Ok(runtime) = DockerRuntime::new() else {
            return;
        };
        assert_eq!(runtime.stop_timeout, DEFAULT_STOP_TIMEOUT);
        assert_eq!(runtime.pull_timeout, DEFAULT_PULL_TIMEOUT);

        let runtime = runtime
            .with_stop_timeout(Duration::from_secs(1))
            .with_pull_timeout(Duration::from_secs(30));

        assert_eq!(runtime.stop_timeout, Duration::from_secs(1));
        assert_eq!(runtime.pull_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_memory_limit_saturates_instead_of_overflowing() {
        assert_eq!(memory_bytes(512), 512 * 1024 * 1024);
        assert_eq!(memory_bytes(u64::MAX), i64::MAX);
        assert_eq!(memory_bytes(i64::MAX as u64), i64::MAX);
    }

    #[test]
    fn test_instance_config_applies_limits_and_labels() {
        let spec = InstanceSpec {
            name: "sbpanel-u1-web1".to_string(),
            image: "ubuntu:20.04".to_string(),
            cpu_cores: 2,
            memory_mb: 1024,
            disk_mb: 5120,
            labels: HashMap::from([(SANDBOX_ID_LABEL.to_string(), "7".to_string())]),
        };

        let config = DockerRuntime::instance_config(&spec);
        let host_config = config.host_config.unwrap();

        assert_eq!(host_config.nano_cpus, Some(2_000_000_000));
        assert_eq!(host_config.memory, Some(1024 * 1024 * 1024));
        assert_eq!(config.tty, Some(true));
        assert_eq!(config.open_stdin, Some(true));

        let labels = config.labels.unwrap();
        assert_eq!(labels.get(MANAGED_LABEL), Some(&"true".to_string()));
        assert_eq!(labels.get(SANDBOX_ID_LABEL), Some(&"7".to_string()));
    }

    #[test]
    fn test_convert_state() {
        assert_eq!(DockerRuntime::convert_state("running"), InstanceState::Running);
        assert_eq!(DockerRuntime::convert_state("exited"), InstanceState::Exited);
        assert_eq!(DockerRuntime::convert_state("weird"), InstanceState::Unknown);
    }

    #[test]
    fn test_error_mapping_distinguishes_not_found() {
        let not_found = map_error(
            "abc",
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
        );
        assert!(matches!(not_found, RuntimeError::NotFound(ref id) if id == "abc"));

        let api = map_error(
            "abc",
            BollardError::DockerResponseServerError {
                status_code: 500,
                message: "boom".to_string(),
            },
        );
        assert!(matches!(api, RuntimeError::Api { status: 500, .. }));
    }

    #[test]
    fn test_split_remote_path() {
        let (parent, name) = split_remote_path("/var/www/html/index.html").unwrap();
        assert_eq!(parent, "/var/www/html");
        assert_eq!(name, "index.html");

        let (parent, name) = split_remote_path("/motd").unwrap();
        assert_eq!(parent, "/");
        assert_eq!(name, "motd");

        assert!(split_remote_path("/").is_err());
    }

    #[test]
    fn test_single_file_archive_extracts_named_entry() {
        let archive = pack_single_file("index.html", b"<h1>hello</h1>").unwrap();
        let contents = unpack_single_file(&archive, "index.html").unwrap();
        assert_eq!(contents, b"<h1>hello</h1>");

        let missing = unpack_single_file(&archive, "other.html");
        assert!(missing.is_err());
    }
}
