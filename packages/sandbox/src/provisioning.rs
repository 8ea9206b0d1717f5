// ABOUTME: Bounded background worker pool that provisions freshly created sandboxes
// ABOUTME: Jobs are plain messages; workers own their storage and runtime handles

use crate::executor::CommandExecutor;
use crate::provisioner::{ProvisionError, SoftwareProvisioner};
use crate::runtime::Runtime;
use crate::storage::{
    NewService, SandboxStatus, SandboxStorage, ServiceStatus, StorageError, Transition,
};
use sbpanel_config::defaults;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Provisioning already in flight for sandbox {0}")]
    AlreadyInFlight(i64),

    #[error("Provisioning queue is shut down")]
    Closed,
}

/// Work item handed to the pool. Carries identifiers only, never live request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionJob {
    pub sandbox_id: i64,
    pub runtime_id: String,
    pub template: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: defaults::PROVISION_WORKERS,
            capacity: defaults::PROVISION_QUEUE_CAPACITY,
        }
    }
}

/// How a job ended, as far as the persisted record is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Record moved to `running`
    Completed,
    /// Record moved to `error_provisioning`
    Failed,
    /// Record was deleted or changed underneath the job; nothing written
    Abandoned,
}

pub struct ProvisioningQueue {
    sender: RwLock<Option<mpsc::Sender<ProvisionJob>>>,
    in_flight: Arc<Mutex<HashSet<i64>>>,
    idle: Arc<Notify>,
    submitted: AtomicU64,
    workers: Mutex<JoinSet<()>>,
}

impl ProvisioningQueue {
    /// Spawn `config.workers` workers sharing one bounded channel
    pub fn start(
        config: PoolConfig,
        storage: Arc<SandboxStorage>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let idle = Arc::new(Notify::new());

        let worker = ProvisioningWorker {
            storage,
            provisioner: SoftwareProvisioner::new(CommandExecutor::new(runtime.clone())),
            runtime,
        };

        let mut workers = JoinSet::new();
        for index in 0..config.workers.max(1) {
            workers.spawn(worker_loop(
                index,
                receiver.clone(),
                worker.clone(),
                in_flight.clone(),
                idle.clone(),
            ));
        }

        info!(
            workers = config.workers.max(1),
            capacity = config.capacity.max(1),
            "Provisioning pool started"
        );

        Self {
            sender: RwLock::new(Some(sender)),
            in_flight,
            idle,
            submitted: AtomicU64::new(0),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job, waiting for space if the queue is full
    pub async fn submit(&self, job: ProvisionJob) -> Result<(), QueueError> {
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or(QueueError::Closed)?;

        if !self.in_flight.lock().await.insert(job.sandbox_id) {
            return Err(QueueError::AlreadyInFlight(job.sandbox_id));
        }

        let sandbox_id = job.sandbox_id;
        if sender.send(job).await.is_err() {
            self.in_flight.lock().await.remove(&sandbox_id);
            self.idle.notify_waiters();
            return Err(QueueError::Closed);
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(sandbox_id, "Provisioning job queued");
        Ok(())
    }

    pub async fn is_in_flight(&self, sandbox_id: i64) -> bool {
        self.in_flight.lock().await.contains(&sandbox_id)
    }

    /// Number of jobs accepted since start
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Resolve once no job is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs, let queued jobs finish and join the workers
    pub async fn shutdown(&self) {
        self.sender.write().await.take();

        let mut workers = self.workers.lock().await;
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Provisioning worker terminated abnormally");
            }
        }
        info!("Provisioning pool stopped");
    }
}

async fn worker_loop(
    index: usize,
    receiver: Arc<Mutex<mpsc::Receiver<ProvisionJob>>>,
    worker: ProvisioningWorker,
    in_flight: Arc<Mutex<HashSet<i64>>>,
    idle: Arc<Notify>,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let sandbox_id = job.sandbox_id;
        debug!(worker = index, sandbox_id, "Provisioning job picked up");

        // Run in its own task so a panic cannot take the worker down with it
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(job).await }
        });
        match handle.await {
            Ok(outcome) => debug!(worker = index, sandbox_id, ?outcome, "Provisioning job finished"),
            Err(e) => error!(worker = index, sandbox_id, error = %e, "Provisioning job panicked"),
        }

        in_flight.lock().await.remove(&sandbox_id);
        idle.notify_waiters();
    }

    debug!(worker = index, "Provisioning worker exiting");
}

#[derive(Clone)]
struct ProvisioningWorker {
    storage: Arc<SandboxStorage>,
    runtime: Arc<dyn Runtime>,
    provisioner: SoftwareProvisioner,
}

impl ProvisioningWorker {
    async fn run(&self, job: ProvisionJob) -> JobOutcome {
        let sandbox = match self.storage.get_sandbox(job.sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(StorageError::NotFound(_)) => {
                info!(
                    sandbox_id = job.sandbox_id,
                    runtime_id = %job.runtime_id,
                    "Sandbox deleted before provisioning started"
                );
                return JobOutcome::Abandoned;
            }
            Err(e) => {
                error!(
                    sandbox_id = job.sandbox_id,
                    runtime_id = %job.runtime_id,
                    operation = "provision",
                    error = %e,
                    "Failed to load sandbox for provisioning"
                );
                return JobOutcome::Abandoned;
            }
        };

        if sandbox.status != SandboxStatus::Creating
            || sandbox.runtime_id.as_deref() != Some(job.runtime_id.as_str())
        {
            warn!(
                sandbox_id = job.sandbox_id,
                runtime_id = %job.runtime_id,
                status = %sandbox.status,
                "Sandbox no longer awaiting provisioning, skipping"
            );
            return JobOutcome::Abandoned;
        }

        info!(
            sandbox_id = job.sandbox_id,
            runtime_id = %job.runtime_id,
            template = %job.template,
            "Provisioning sandbox"
        );

        match self.provision(&job).await {
            Ok((address, services)) => self.complete(&job, address, services).await,
            Err(e) => self.fail(&job, e).await,
        }
    }

    async fn provision(
        &self,
        job: &ProvisionJob,
    ) -> Result<(Option<String>, Vec<NewService>), ProvisionError> {
        let started = self
            .provisioner
            .provision(&job.runtime_id, &job.template)
            .await?;

        if !self.runtime.state(&job.runtime_id).await?.is_live() {
            return Err(ProvisionError::NotRunning(job.runtime_id.clone()));
        }
        let address = self.runtime.address(&job.runtime_id).await?;

        let services = started
            .into_iter()
            .map(|service| NewService {
                name: service.spec.name.to_string(),
                service_type: service.spec.kind.as_str().to_string(),
                status: if service.outcome.applied() {
                    ServiceStatus::Running
                } else {
                    ServiceStatus::Failed
                },
                port: service.spec.port.map(i64::from),
            })
            .collect();

        Ok((address, services))
    }

    async fn complete(
        &self,
        job: &ProvisionJob,
        address: Option<String>,
        services: Vec<NewService>,
    ) -> JobOutcome {
        match self
            .storage
            .complete_provisioning(job.sandbox_id, &job.runtime_id, address.as_deref(), &services)
            .await
        {
            Ok(true) => {
                info!(
                    sandbox_id = job.sandbox_id,
                    runtime_id = %job.runtime_id,
                    address = ?address,
                    "Sandbox provisioned"
                );
                JobOutcome::Completed
            }
            Ok(false) => {
                self.report_lost_write(job).await;
                JobOutcome::Abandoned
            }
            Err(e) => {
                error!(
                    sandbox_id = job.sandbox_id,
                    runtime_id = %job.runtime_id,
                    operation = "complete_provisioning",
                    error = %e,
                    "Failed to record provisioning result"
                );
                JobOutcome::Abandoned
            }
        }
    }

    async fn fail(&self, job: &ProvisionJob, err: ProvisionError) -> JobOutcome {
        let message = err.to_string();
        error!(
            sandbox_id = job.sandbox_id,
            runtime_id = %job.runtime_id,
            operation = "provision",
            error = %message,
            "Provisioning failed"
        );

        let transition = Transition::new(SandboxStatus::Creating, SandboxStatus::ErrorProvisioning)
            .message(message);

        match self.storage.transition(job.sandbox_id, &transition).await {
            Ok(true) => {
                // The instance is kept for inspection, only stopped
                if let Err(stop_err) = self.runtime.stop(&job.runtime_id).await {
                    warn!(
                        sandbox_id = job.sandbox_id,
                        runtime_id = %job.runtime_id,
                        operation = "stop",
                        error = %stop_err,
                        "Best-effort stop after failed provisioning did not succeed"
                    );
                }
                JobOutcome::Failed
            }
            Ok(false) | Err(StorageError::NotFound(_)) => {
                self.report_lost_write(job).await;
                JobOutcome::Abandoned
            }
            Err(e) => {
                error!(
                    sandbox_id = job.sandbox_id,
                    runtime_id = %job.runtime_id,
                    operation = "mark_error_provisioning",
                    error = %e,
                    "Failed to record provisioning failure"
                );
                JobOutcome::Abandoned
            }
        }
    }

    async fn report_lost_write(&self, job: &ProvisionJob) {
        match self.storage.get_sandbox(job.sandbox_id).await {
            Err(StorageError::NotFound(_)) => info!(
                sandbox_id = job.sandbox_id,
                runtime_id = %job.runtime_id,
                "Sandbox deleted during provisioning, discarding result"
            ),
            Ok(sandbox) => warn!(
                sandbox_id = job.sandbox_id,
                runtime_id = %job.runtime_id,
                status = %sandbox.status,
                "Sandbox changed during provisioning, discarding result"
            ),
            Err(e) => error!(
                sandbox_id = job.sandbox_id,
                runtime_id = %job.runtime_id,
                error = %e,
                "Failed to reload sandbox after provisioning"
            ),
        }
    }
}
