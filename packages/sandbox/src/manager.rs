// ABOUTME: Sandbox lifecycle manager orchestrating storage, runtime and provisioning
// ABOUTME: Owns the status state machine from creation through deletion and reconciliation

use crate::executor::{CommandExecutor, ServiceAction};
use crate::locks::KeyedLocks;
use crate::provisioning::{PoolConfig, ProvisionJob, ProvisioningQueue, QueueError};
use crate::runtime::{InstanceSpec, InstanceState, Runtime, RuntimeError, SANDBOX_ID_LABEL};
use crate::storage::{
    Account, AddressUpdate, NewSandbox, Resources, Sandbox, SandboxStatus, SandboxStorage, Service,
    ServiceStatus, StorageError, Transition,
};
use sbpanel_config::defaults;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MAX_NAME_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("A sandbox named '{0}' already exists")]
    DuplicateName(String),

    #[error("Resource limit exceeded for {resource}: requested {requested}, in use {used}, limit {limit}")]
    ResourceLimitExceeded {
        resource: &'static str,
        requested: i64,
        used: i64,
        limit: i64,
    },

    #[error("Sandbox not found: {0}")]
    NotFound(i64),

    #[error("Service not found: {0}")]
    ServiceNotFound(i64),

    #[error("Account {caller} does not own sandbox {sandbox_id}")]
    Forbidden { sandbox_id: i64, caller: i64 },

    #[error("Operation requires an administrator")]
    AdminRequired,

    #[error("Cannot {operation} sandbox {sandbox_id} while it is {status}")]
    InvalidState {
        sandbox_id: i64,
        status: SandboxStatus,
        operation: &'static str,
    },

    #[error("Sandbox {sandbox_id} still has {sites} site(s) and {databases} database(s); remove them first")]
    HasDependents {
        sandbox_id: i64,
        sites: i64,
        databases: i64,
    },

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Provisioning queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<StorageError> for ManagerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::HasDependents {
                sandbox_id,
                sites,
                databases,
            } => ManagerError::HasDependents {
                sandbox_id,
                sites,
                databases,
            },
            StorageError::Validation(message) => ManagerError::Validation(message),
            other => ManagerError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Identity on whose behalf an operation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub account_id: i64,
    pub is_admin: bool,
}

impl Caller {
    pub fn account(account_id: i64) -> Self {
        Self {
            account_id,
            is_admin: false,
        }
    }

    pub fn admin(account_id: i64) -> Self {
        Self {
            account_id,
            is_admin: true,
        }
    }

    pub fn can_manage(&self, sandbox: &Sandbox) -> bool {
        self.is_admin || sandbox.owner_id == self.account_id
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Base image every sandbox is created from
    pub image: String,
    /// Prefix of derived runtime instance names
    pub name_prefix: String,
    pub pool: PoolConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            image: defaults::BASE_IMAGE.to_string(),
            name_prefix: defaults::RUNTIME_PREFIX.to_string(),
            pool: PoolConfig::default(),
        }
    }
}

/// Request to create a new sandbox
#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub name: String,
    pub template: String,
    pub owner_id: i64,
    pub resources: Resources,
}

/// A sandbox record together with what the runtime reports for it
#[derive(Debug, Clone, Serialize)]
pub struct SandboxView {
    pub sandbox: Sandbox,
    /// `None` when the sandbox has no instance or the runtime no longer knows it
    #[serde(serialize_with = "serialize_state")]
    pub live_state: Option<InstanceState>,
    /// Set when the record claims `running` but the runtime does not confirm it
    pub drift: bool,
}

fn serialize_state<S>(state: &Option<InstanceState>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match state {
        Some(state) => serializer.serialize_some(state.as_str()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub sandbox_id: i64,
    pub runtime_id: Option<String>,
    pub runtime_removed: bool,
    /// Set when the runtime instance was left behind and queued for reconciliation
    pub reconciliation_task: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub tasks_resolved: usize,
    pub tasks_pending: usize,
    pub orphans_removed: Vec<String>,
    pub orphan_failures: Vec<String>,
}

/// Derive the runtime instance name for a sandbox
pub fn runtime_name(prefix: &str, owner_id: i64, name: &str) -> String {
    format!("{}-u{}-{}", prefix, owner_id, name).to_lowercase()
}

fn validate_request(request: &CreateSandboxRequest) -> Result<()> {
    let name = request.name.as_str();
    if name.is_empty() {
        return Err(ManagerError::Validation("Sandbox name is required".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ManagerError::Validation(format!(
            "Sandbox name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ManagerError::Validation(
            "Sandbox name may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    if request.template.trim().is_empty() {
        return Err(ManagerError::Validation("Template is required".to_string()));
    }

    let Resources {
        cpu,
        memory_mb,
        disk_mb,
    } = request.resources;
    if cpu <= 0 || memory_mb <= 0 || disk_mb <= 0 {
        return Err(ManagerError::Validation(
            "CPU, memory and disk allocations must be positive".to_string(),
        ));
    }

    Ok(())
}

/// Check each resource independently; the first breach rejects the request
fn check_quota(limits: Resources, used: Resources, requested: Resources) -> Result<()> {
    let checks = [
        ("cpu", requested.cpu, used.cpu, limits.cpu),
        ("memory", requested.memory_mb, used.memory_mb, limits.memory_mb),
        ("disk", requested.disk_mb, used.disk_mb, limits.disk_mb),
    ];

    for (resource, requested, used, limit) in checks {
        if used.checked_add(requested).map_or(true, |total| total > limit) {
            return Err(ManagerError::ResourceLimitExceeded {
                resource,
                requested,
                used,
                limit,
            });
        }
    }

    Ok(())
}

/// Sandbox lifecycle manager
pub struct SandboxManager {
    storage: Arc<SandboxStorage>,
    runtime: Arc<dyn Runtime>,
    executor: CommandExecutor,
    queue: ProvisioningQueue,
    sandbox_locks: Arc<KeyedLocks<i64>>,
    owner_locks: KeyedLocks<i64>,
    config: ManagerConfig,
}

impl SandboxManager {
    /// Build the manager and start its provisioning workers
    pub fn new(
        storage: Arc<SandboxStorage>,
        runtime: Arc<dyn Runtime>,
        config: ManagerConfig,
    ) -> Self {
        let queue = ProvisioningQueue::start(config.pool, storage.clone(), runtime.clone());
        Self {
            executor: CommandExecutor::new(runtime.clone()),
            storage,
            runtime,
            queue,
            sandbox_locks: Arc::new(KeyedLocks::new()),
            owner_locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn storage(&self) -> &Arc<SandboxStorage> {
        &self.storage
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Per-sandbox locks shared with other writers of sandbox state
    pub fn sandbox_locks(&self) -> Arc<KeyedLocks<i64>> {
        self.sandbox_locks.clone()
    }

    /// Resolve an account id into a caller identity
    pub async fn caller(&self, account_id: i64) -> Result<Caller> {
        let account = self.storage.get_account(account_id).await?;
        Ok(Caller {
            account_id: account.id,
            is_admin: account.is_admin,
        })
    }

    /// Replace an account's resource limits (administrators only)
    ///
    /// Lowering limits below current usage is allowed; it only blocks new sandboxes.
    pub async fn set_account_limits(
        &self,
        account_id: i64,
        limits: Resources,
        caller: Caller,
    ) -> Result<Account> {
        if !caller.is_admin {
            return Err(ManagerError::AdminRequired);
        }
        if limits.cpu <= 0 || limits.memory_mb <= 0 || limits.disk_mb <= 0 {
            return Err(ManagerError::Validation(
                "CPU, memory and disk limits must be positive".to_string(),
            ));
        }

        let _guard = self.owner_locks.lock(account_id).await;
        self.storage.set_account_limits(account_id, limits).await?;

        info!(
            account_id,
            cpu = limits.cpu,
            memory_mb = limits.memory_mb,
            disk_mb = limits.disk_mb,
            "Account limits updated"
        );
        self.record_activity(
            caller.account_id,
            "account.limits",
            format!(
                "account {}: {} CPU / {} MB RAM / {} MB disk",
                account_id, limits.cpu, limits.memory_mb, limits.disk_mb
            ),
        )
        .await;
        Ok(self.storage.get_account(account_id).await?)
    }

    /// Create a sandbox and hand its software installation to the provisioning pool
    ///
    /// Returns the record while still `creating`; the caller never waits for
    /// provisioning. A runtime allocation failure leaves the record in
    /// `error_creating_base` and is returned as an error.
    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<Sandbox> {
        validate_request(&request)?;

        let sandbox = {
            let _owner_guard = self.owner_locks.lock(request.owner_id).await;

            let account = match self.storage.get_account(request.owner_id).await {
                Ok(account) => account,
                Err(StorageError::NotFound(_)) => {
                    return Err(ManagerError::Validation(format!(
                        "Unknown owner account {}",
                        request.owner_id
                    )))
                }
                Err(e) => return Err(e.into()),
            };

            if self
                .storage
                .find_sandbox_by_name(account.id, &request.name)
                .await?
                .is_some()
            {
                return Err(ManagerError::DuplicateName(request.name));
            }

            let used = self.storage.usage_for_owner(account.id).await?;
            check_quota(account.limits, used, request.resources)?;

            let runtime_name = runtime_name(&self.config.name_prefix, account.id, &request.name);
            self.storage
                .insert_sandbox(NewSandbox {
                    name: request.name.clone(),
                    owner_id: account.id,
                    runtime_name,
                    template: request.template.clone(),
                    resources: request.resources,
                })
                .await
                .map_err(|e| match e {
                    StorageError::Conflict(_) => ManagerError::DuplicateName(request.name.clone()),
                    other => other.into(),
                })?
        };

        let _guard = self.sandbox_locks.lock(sandbox.id).await;
        info!(
            sandbox_id = sandbox.id,
            runtime_name = %sandbox.runtime_name,
            template = %sandbox.template,
            "Creating sandbox"
        );

        let spec = InstanceSpec {
            name: sandbox.runtime_name.clone(),
            image: self.config.image.clone(),
            cpu_cores: u32::try_from(sandbox.resources.cpu).unwrap_or(u32::MAX),
            memory_mb: u64::try_from(sandbox.resources.memory_mb).unwrap_or_default(),
            disk_mb: u64::try_from(sandbox.resources.disk_mb).unwrap_or_default(),
            labels: HashMap::from([(SANDBOX_ID_LABEL.to_string(), sandbox.id.to_string())]),
        };

        let runtime_id = match self.runtime.create(&spec).await {
            Ok(runtime_id) => runtime_id,
            Err(e) => {
                error!(
                    sandbox_id = sandbox.id,
                    runtime_name = %sandbox.runtime_name,
                    operation = "create",
                    error = %e,
                    "Runtime allocation failed"
                );
                self.mark_creation_failed(sandbox.id, SandboxStatus::ErrorCreatingBase, &e.to_string())
                    .await;
                self.record_activity(
                    sandbox.owner_id,
                    "sandbox.create_failed",
                    format!("{}: {}", sandbox.name, e),
                )
                .await;
                return Err(e.into());
            }
        };

        let address = self.fetch_address(sandbox.id, &runtime_id).await;
        if let Err(e) = self
            .storage
            .attach_runtime(sandbox.id, &runtime_id, address.as_deref())
            .await
        {
            error!(
                sandbox_id = sandbox.id,
                runtime_id = %runtime_id,
                operation = "attach_runtime",
                error = %e,
                "Failed to record runtime instance"
            );
            self.mark_creation_failed(sandbox.id, SandboxStatus::ErrorCreatingBase, &e.to_string())
                .await;
            if let Err(remove_err) = self.runtime.remove(&runtime_id, true).await {
                self.queue_reconciliation(sandbox.id, &runtime_id, "remove", &remove_err)
                    .await;
            }
            return Err(e.into());
        }

        let job = ProvisionJob {
            sandbox_id: sandbox.id,
            runtime_id: runtime_id.clone(),
            template: sandbox.template.clone(),
        };
        if let Err(e) = self.queue.submit(job).await {
            error!(
                sandbox_id = sandbox.id,
                runtime_id = %runtime_id,
                operation = "submit_provisioning",
                error = %e,
                "Failed to queue provisioning"
            );
            self.mark_creation_failed(sandbox.id, SandboxStatus::ErrorProvisioning, &e.to_string())
                .await;
            return Err(e.into());
        }

        self.record_activity(
            sandbox.owner_id,
            "sandbox.create",
            format!("{} ({})", sandbox.name, sandbox.template),
        )
        .await;

        Ok(self.storage.get_sandbox(sandbox.id).await?)
    }

    pub async fn start_sandbox(&self, id: i64, caller: Caller) -> Result<Sandbox> {
        let _guard = self.sandbox_locks.lock(id).await;
        let sandbox = self.load_authorized(id, caller).await?;
        let runtime_id = Self::require_state(&sandbox, &[SandboxStatus::Stopped], "start")?;

        self.runtime
            .start(&runtime_id)
            .await
            .inspect_err(|e| log_runtime_failure(&sandbox, &runtime_id, "start", e))?;
        let address = self.fetch_address(id, &runtime_id).await;

        self.apply(
            &sandbox,
            Transition::new(SandboxStatus::Stopped, SandboxStatus::Running).address(address),
            "start",
        )
        .await?;

        self.boot_services(id, &runtime_id).await;

        info!(sandbox_id = id, runtime_id = %runtime_id, "Sandbox started");
        self.record_activity(caller.account_id, "sandbox.start", sandbox.name.clone())
            .await;
        Ok(self.storage.get_sandbox(id).await?)
    }

    pub async fn stop_sandbox(&self, id: i64, caller: Caller) -> Result<Sandbox> {
        let _guard = self.sandbox_locks.lock(id).await;
        let sandbox = self.load_authorized(id, caller).await?;
        let runtime_id = Self::require_state(&sandbox, &[SandboxStatus::Running], "stop")?;

        self.runtime
            .stop(&runtime_id)
            .await
            .inspect_err(|e| log_runtime_failure(&sandbox, &runtime_id, "stop", e))?;

        self.apply(
            &sandbox,
            Transition::new(SandboxStatus::Running, SandboxStatus::Stopped)
                .address(AddressUpdate::Clear),
            "stop",
        )
        .await?;

        if let Err(e) = self.storage.mark_services_stopped(id).await {
            warn!(sandbox_id = id, error = %e, "Failed to mark services stopped");
        }

        info!(sandbox_id = id, runtime_id = %runtime_id, "Sandbox stopped");
        self.record_activity(caller.account_id, "sandbox.stop", sandbox.name.clone())
            .await;
        Ok(self.storage.get_sandbox(id).await?)
    }

    pub async fn restart_sandbox(&self, id: i64, caller: Caller) -> Result<Sandbox> {
        let _guard = self.sandbox_locks.lock(id).await;
        let sandbox = self.load_authorized(id, caller).await?;
        let runtime_id = Self::require_state(
            &sandbox,
            &[SandboxStatus::Running, SandboxStatus::Stopped],
            "restart",
        )?;

        self.runtime
            .restart(&runtime_id)
            .await
            .inspect_err(|e| log_runtime_failure(&sandbox, &runtime_id, "restart", e))?;
        let address = self.fetch_address(id, &runtime_id).await;

        self.apply(
            &sandbox,
            Transition::new(sandbox.status, SandboxStatus::Running).address(address),
            "restart",
        )
        .await?;

        self.boot_services(id, &runtime_id).await;

        info!(sandbox_id = id, runtime_id = %runtime_id, "Sandbox restarted");
        self.record_activity(caller.account_id, "sandbox.restart", sandbox.name.clone())
            .await;
        Ok(self.storage.get_sandbox(id).await?)
    }

    /// Delete a sandbox record, its services and jobs, then its runtime instance
    ///
    /// Refused while sites or databases reference the sandbox. Once the record
    /// is gone a failed runtime removal is queued for reconciliation instead of
    /// being returned as an error.
    pub async fn delete_sandbox(&self, id: i64, caller: Caller) -> Result<DeleteReport> {
        let _guard = self.sandbox_locks.lock(id).await;
        let sandbox = self.load_authorized(id, caller).await?;

        let dependents = self.storage.count_dependents(id).await?;
        if !dependents.is_empty() {
            return Err(ManagerError::HasDependents {
                sandbox_id: id,
                sites: dependents.sites,
                databases: dependents.databases,
            });
        }

        let deleted = self.storage.delete_sandbox(id).await?;
        info!(
            sandbox_id = id,
            runtime_id = ?deleted.runtime_id,
            status = %deleted.status,
            "Sandbox record deleted"
        );

        let mut report = DeleteReport {
            sandbox_id: id,
            runtime_id: deleted.runtime_id.clone(),
            runtime_removed: true,
            reconciliation_task: None,
        };

        if let Some(runtime_id) = &deleted.runtime_id {
            match self.runtime.remove(runtime_id, true).await {
                Ok(()) => debug!(sandbox_id = id, runtime_id = %runtime_id, "Runtime instance removed"),
                Err(e) if e.is_not_found() => {
                    debug!(sandbox_id = id, runtime_id = %runtime_id, "Runtime instance already gone")
                }
                Err(e) => {
                    report.runtime_removed = false;
                    report.reconciliation_task =
                        self.queue_reconciliation(id, runtime_id, "remove", &e).await;
                }
            }
        }

        self.record_activity(caller.account_id, "sandbox.delete", deleted.name.clone())
            .await;
        Ok(report)
    }

    /// Return the record with the live runtime state, flagging a record that claims
    /// `running` for an instance the runtime does not report as running
    pub async fn get_sandbox_status(&self, id: i64, caller: Caller) -> Result<SandboxView> {
        let sandbox = self.load_authorized(id, caller).await?;

        let live_state = match &sandbox.runtime_id {
            Some(runtime_id) => match self.runtime.state(runtime_id).await {
                Ok(state) => Some(state),
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    log_runtime_failure(&sandbox, runtime_id, "state", &e);
                    return Err(e.into());
                }
            },
            None => None,
        };

        let drift = sandbox.status == SandboxStatus::Running
            && !live_state.is_some_and(|state| state.is_live());
        if drift {
            warn!(
                sandbox_id = id,
                runtime_id = ?sandbox.runtime_id,
                live_state = live_state.map(|s| s.as_str()).unwrap_or("missing"),
                "Sandbox recorded as running but runtime disagrees"
            );
        }

        Ok(SandboxView {
            sandbox,
            live_state,
            drift,
        })
    }

    /// The caller's sandboxes, or every sandbox for an administrator
    pub async fn list_sandboxes(
        &self,
        caller: Caller,
        status: Option<SandboxStatus>,
    ) -> Result<Vec<Sandbox>> {
        let owner = (!caller.is_admin).then_some(caller.account_id);
        Ok(self.storage.list_sandboxes(owner, status).await?)
    }

    /// Send a sandbox stuck in `error_provisioning` through provisioning again
    pub async fn retry_provisioning(&self, id: i64, caller: Caller) -> Result<Sandbox> {
        let _guard = self.sandbox_locks.lock(id).await;
        let sandbox = self.load_authorized(id, caller).await?;
        let runtime_id =
            Self::require_state(&sandbox, &[SandboxStatus::ErrorProvisioning], "retry provisioning")?;

        self.apply(
            &sandbox,
            Transition::new(SandboxStatus::ErrorProvisioning, SandboxStatus::Creating),
            "retry provisioning",
        )
        .await?;

        let revive = async {
            if !self.runtime.state(&runtime_id).await?.is_live() {
                self.runtime.start(&runtime_id).await?;
            }
            Ok::<_, RuntimeError>(())
        };
        if let Err(e) = revive.await {
            log_runtime_failure(&sandbox, &runtime_id, "start", &e);
            self.mark_creation_failed(id, SandboxStatus::ErrorProvisioning, &e.to_string())
                .await;
            return Err(e.into());
        }

        let job = ProvisionJob {
            sandbox_id: id,
            runtime_id: runtime_id.clone(),
            template: sandbox.template.clone(),
        };
        if let Err(e) = self.queue.submit(job).await {
            self.mark_creation_failed(id, SandboxStatus::ErrorProvisioning, &e.to_string())
                .await;
            return Err(e.into());
        }

        info!(sandbox_id = id, runtime_id = %runtime_id, "Provisioning retry queued");
        self.record_activity(caller.account_id, "sandbox.retry", sandbox.name.clone())
            .await;
        Ok(self.storage.get_sandbox(id).await?)
    }

    /// Start, stop or restart one managed service inside a running sandbox
    pub async fn control_service(
        &self,
        service_id: i64,
        caller: Caller,
        action: ServiceAction,
    ) -> Result<Service> {
        let service = self.load_service(service_id).await?;

        let _guard = self.sandbox_locks.lock(service.sandbox_id).await;
        let sandbox = self.load_authorized(service.sandbox_id, caller).await?;
        let runtime_id = Self::require_state(&sandbox, &[SandboxStatus::Running], "control services of")?;

        let outcome = self
            .executor
            .control_service(&runtime_id, &service.name, action)
            .await;
        let status = match (outcome.applied(), action) {
            (false, _) => ServiceStatus::Failed,
            (true, ServiceAction::Stop) => ServiceStatus::Stopped,
            (true, ServiceAction::Start | ServiceAction::Restart) => ServiceStatus::Running,
        };
        self.storage.set_service_status(service_id, status).await?;

        self.record_activity(
            caller.account_id,
            "service.control",
            format!("{} {} on {}", action, service.name, sandbox.name),
        )
        .await;
        Ok(self.storage.get_service(service_id).await?)
    }

    /// Flip whether a service is started when its sandbox boots
    pub async fn toggle_auto_start(&self, service_id: i64, caller: Caller) -> Result<Service> {
        let service = self.load_service(service_id).await?;

        let _guard = self.sandbox_locks.lock(service.sandbox_id).await;
        let sandbox = self.load_authorized(service.sandbox_id, caller).await?;

        let auto_start = !service.auto_start;
        self.storage
            .set_service_auto_start(service_id, auto_start)
            .await?;

        info!(service_id, service = %service.name, auto_start, "Service auto-start toggled");
        self.record_activity(
            caller.account_id,
            "service.autostart",
            format!(
                "{} on {} {}",
                service.name,
                sandbox.name,
                if auto_start { "enabled" } else { "disabled" }
            ),
        )
        .await;
        Ok(self.storage.get_service(service_id).await?)
    }

    /// Retry removal of instances left behind by deletes, then remove panel-labelled
    /// instances no record refers to
    pub async fn reconcile(&self, caller: Caller) -> Result<ReconcileReport> {
        if !caller.is_admin {
            return Err(ManagerError::AdminRequired);
        }

        let mut report = ReconcileReport::default();

        for task in self.storage.list_pending_reconciliations().await? {
            match self.runtime.remove(&task.runtime_id, true).await {
                Ok(()) => {
                    self.storage.resolve_reconciliation(task.id).await?;
                    report.tasks_resolved += 1;
                }
                Err(e) if e.is_not_found() => {
                    self.storage.resolve_reconciliation(task.id).await?;
                    report.tasks_resolved += 1;
                }
                Err(e) => {
                    warn!(
                        sandbox_id = task.sandbox_id,
                        runtime_id = %task.runtime_id,
                        operation = %task.operation,
                        attempts = task.attempts + 1,
                        error = %e,
                        "Reconciliation attempt failed"
                    );
                    self.storage
                        .record_reconciliation_attempt(task.id, &e.to_string())
                        .await?;
                    report.tasks_pending += 1;
                }
            }
        }

        for instance in self.runtime.list_managed().await? {
            if self
                .storage
                .find_sandbox_by_runtime_id(&instance.runtime_id)
                .await?
                .is_some()
            {
                continue;
            }
            // An instance still being attached to its record carries the record id
            if let Some(sandbox_id) = instance.sandbox_id {
                match self.storage.get_sandbox(sandbox_id).await {
                    Ok(_) => continue,
                    Err(StorageError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            warn!(
                runtime_id = %instance.runtime_id,
                name = %instance.name,
                state = instance.state.as_str(),
                "Removing orphaned runtime instance"
            );
            match self.runtime.remove(&instance.runtime_id, true).await {
                Ok(()) => report.orphans_removed.push(instance.runtime_id),
                Err(e) if e.is_not_found() => report.orphans_removed.push(instance.runtime_id),
                Err(e) => {
                    error!(
                        runtime_id = %instance.runtime_id,
                        operation = "remove",
                        error = %e,
                        "Failed to remove orphaned runtime instance"
                    );
                    report
                        .orphan_failures
                        .push(format!("{}: {}", instance.runtime_id, e));
                }
            }
        }

        info!(
            resolved = report.tasks_resolved,
            pending = report.tasks_pending,
            orphans_removed = report.orphans_removed.len(),
            orphan_failures = report.orphan_failures.len(),
            "Reconciliation finished"
        );
        self.record_activity(
            caller.account_id,
            "runtime.reconcile",
            format!(
                "resolved {}, pending {}, orphans removed {}",
                report.tasks_resolved,
                report.tasks_pending,
                report.orphans_removed.len()
            ),
        )
        .await;
        Ok(report)
    }

    /// Wait until every queued provisioning job has finished
    pub async fn wait_for_provisioning(&self) {
        self.queue.wait_idle().await;
    }

    /// Stop accepting provisioning work and wait for the workers to finish
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    async fn load_authorized(&self, id: i64, caller: Caller) -> Result<Sandbox> {
        let sandbox = match self.storage.get_sandbox(id).await {
            Ok(sandbox) => sandbox,
            Err(StorageError::NotFound(_)) => return Err(ManagerError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };

        if !caller.can_manage(&sandbox) {
            warn!(
                sandbox_id = id,
                caller = caller.account_id,
                "Rejected operation on sandbox owned by another account"
            );
            return Err(ManagerError::Forbidden {
                sandbox_id: id,
                caller: caller.account_id,
            });
        }

        Ok(sandbox)
    }

    async fn load_service(&self, service_id: i64) -> Result<Service> {
        match self.storage.get_service(service_id).await {
            Ok(service) => Ok(service),
            Err(StorageError::NotFound(_)) => Err(ManagerError::ServiceNotFound(service_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Start auto-start services after the instance booted and record each outcome
    ///
    /// The base image runs no init system, so nothing else brings daemons back.
    /// Failures are recorded on the service row and never fail the caller.
    async fn boot_services(&self, sandbox_id: i64, runtime_id: &str) {
        let services = match self.storage.list_services(sandbox_id).await {
            Ok(services) => services,
            Err(e) => {
                warn!(sandbox_id, error = %e, "Failed to load services after boot");
                return;
            }
        };

        for service in services {
            let status = if service.auto_start {
                let outcome = self
                    .executor
                    .control_service(runtime_id, &service.name, ServiceAction::Start)
                    .await;
                if outcome.applied() {
                    ServiceStatus::Running
                } else {
                    ServiceStatus::Failed
                }
            } else {
                ServiceStatus::Stopped
            };

            if let Err(e) = self.storage.set_service_status(service.id, status).await {
                warn!(
                    sandbox_id,
                    service = %service.name,
                    error = %e,
                    "Failed to record service status"
                );
            }
        }
    }

    /// Check the sandbox is in one of `allowed` and return its runtime id
    fn require_state(
        sandbox: &Sandbox,
        allowed: &[SandboxStatus],
        operation: &'static str,
    ) -> Result<String> {
        let invalid = || ManagerError::InvalidState {
            sandbox_id: sandbox.id,
            status: sandbox.status,
            operation,
        };

        if !allowed.contains(&sandbox.status) {
            return Err(invalid());
        }
        sandbox.runtime_id.clone().ok_or_else(invalid)
    }

    async fn apply(
        &self,
        sandbox: &Sandbox,
        transition: Transition,
        operation: &'static str,
    ) -> Result<()> {
        if self.storage.transition(sandbox.id, &transition).await? {
            return Ok(());
        }

        let current = self.storage.get_sandbox(sandbox.id).await?;
        Err(ManagerError::InvalidState {
            sandbox_id: sandbox.id,
            status: current.status,
            operation,
        })
    }

    async fn fetch_address(&self, sandbox_id: i64, runtime_id: &str) -> Option<String> {
        match self.runtime.address(runtime_id).await {
            Ok(address) => address,
            Err(e) => {
                warn!(
                    sandbox_id,
                    runtime_id = %runtime_id,
                    operation = "address",
                    error = %e,
                    "Failed to read sandbox address"
                );
                None
            }
        }
    }

    async fn mark_creation_failed(&self, sandbox_id: i64, status: SandboxStatus, message: &str) {
        let transition = Transition::new(SandboxStatus::Creating, status).message(message);
        match self.storage.transition(sandbox_id, &transition).await {
            Ok(true) => {}
            Ok(false) => warn!(sandbox_id, status = %status, "Sandbox left creating before failure was recorded"),
            Err(e) => error!(
                sandbox_id,
                status = %status,
                error = %e,
                "Failed to record sandbox failure status"
            ),
        }
    }

    async fn queue_reconciliation(
        &self,
        sandbox_id: i64,
        runtime_id: &str,
        operation: &str,
        err: &RuntimeError,
    ) -> Option<i64> {
        error!(
            sandbox_id,
            runtime_id = %runtime_id,
            operation = %operation,
            error = %err,
            "Runtime instance orphaned, queued for reconciliation"
        );

        match self
            .storage
            .record_reconciliation(runtime_id, sandbox_id, operation, &err.to_string())
            .await
        {
            Ok(task_id) => Some(task_id),
            Err(e) => {
                error!(
                    sandbox_id,
                    runtime_id = %runtime_id,
                    error = %e,
                    "Failed to record reconciliation task"
                );
                None
            }
        }
    }

    async fn record_activity(&self, account_id: i64, action: &str, details: String) {
        if let Err(e) = self
            .storage
            .log_activity(account_id, action, Some(&details))
            .await
        {
            warn!(account_id, action = %action, error = %e, "Failed to write activity log");
        }
    }
}

fn log_runtime_failure(sandbox: &Sandbox, runtime_id: &str, operation: &str, err: &RuntimeError) {
    error!(
        sandbox_id = sandbox.id,
        runtime_id = %runtime_id,
        operation = %operation,
        error = %err,
        "Runtime operation failed"
    );
}
