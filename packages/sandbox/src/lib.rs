// ABOUTME: Sandbox lifecycle orchestration for SBPanel hosting accounts
// ABOUTME: Runtime adapters, provisioning workers, persistence and hosted resource management

pub mod executor;
pub mod files;
pub mod hosting;
pub mod locks;
pub mod manager;
pub mod provisioner;
pub mod provisioning;
pub mod resources;
pub mod runtime;
pub mod settings;
pub mod storage;
pub mod templates;

pub use executor::{CommandExecutor, ExecError, ExecOptions, ExecOutput, ServiceAction};
pub use files::{FileEntry, FileError, FileManager};
pub use hosting::{
    CreateCronJobRequest, CreateDatabaseRequest, CreateSiteRequest, CreatedDatabase,
    HostingError, HostingManager,
};
pub use locks::KeyedLocks;
pub use manager::{
    Caller, CreateSandboxRequest, DeleteReport, ManagerConfig, ManagerError, ReconcileReport,
    SandboxManager, SandboxView,
};
pub use provisioning::{PoolConfig, ProvisioningQueue};
pub use runtime::{DockerRuntime, InstanceState, Runtime, RuntimeError};
pub use settings::SettingsManager;
pub use storage::{
    Account, NewAccount, Resources, Sandbox, SandboxStatus, SandboxStorage, StorageError,
};
pub use templates::{Template, WebServer};
