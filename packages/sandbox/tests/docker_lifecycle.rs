// ABOUTME: Integration tests running the Docker runtime adapter and sandbox manager against a real daemon
// ABOUTME: Every test returns early when no Docker daemon is reachable

use sbpanel_sandbox::runtime::InstanceSpec;
use sbpanel_sandbox::storage::{self, NewAccount};
use sbpanel_sandbox::{
    Caller, CommandExecutor, CreateSandboxRequest, DockerRuntime, FileManager, InstanceState,
    ManagerConfig, Resources, Runtime, RuntimeError, SandboxManager, SandboxStatus,
    SandboxStorage,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const TEST_IMAGE: &str = "alpine:3.19";

/// Connect to Docker, or `None` when the daemon is unavailable
async fn docker() -> Option<Arc<DockerRuntime>> {
    let runtime = match DockerRuntime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("Skipping: Docker unavailable ({})", e);
            return None;
        }
    };
    if let Err(e) = runtime.ping().await {
        println!("Skipping: Docker daemon not responding ({})", e);
        return None;
    }
    Some(Arc::new(runtime.with_stop_timeout(Duration::from_secs(1))))
}

fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, std::process::id())
}

#[tokio::test]
async fn test_runtime_exec_and_file_transfer() {
    let Some(runtime) = docker().await else {
        return;
    };

    let runtime_id = runtime
        .create(&InstanceSpec {
            name: unique_name("sbpanel-it-files"),
            image: TEST_IMAGE.to_string(),
            cpu_cores: 1,
            memory_mb: 256,
            disk_mb: 1024,
            labels: HashMap::new(),
        })
        .await
        .expect("create instance");

    assert_eq!(runtime.state(&runtime_id).await.unwrap(), InstanceState::Running);

    let files = FileManager::new(CommandExecutor::new(runtime.clone()));
    files
        .write_file(&runtime_id, "/tmp/sbpanel/hello.txt", b"hello from the panel\n")
        .await
        .expect("write file");
    let contents = files
        .read_file(&runtime_id, "/tmp/sbpanel/hello.txt")
        .await
        .expect("read file");
    assert_eq!(contents, "hello from the panel\n");

    let listing = files
        .list_directory(&runtime_id, "/tmp/sbpanel")
        .await
        .expect("list directory");
    assert!(listing.iter().any(|entry| entry.name == "hello.txt"));

    runtime.stop(&runtime_id).await.unwrap();
    assert!(!runtime.state(&runtime_id).await.unwrap().is_live());

    runtime.remove(&runtime_id, true).await.unwrap();
    assert!(matches!(
        runtime.state(&runtime_id).await,
        Err(RuntimeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_removing_missing_instance_is_not_found() {
    let Some(runtime) = docker().await else {
        return;
    };

    let err = runtime
        .remove("sbpanel-definitely-missing", true)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_manager_lifecycle_against_docker() {
    let Some(runtime) = docker().await else {
        return;
    };

    let pool = storage::connect("sqlite::memory:", 1)
        .await
        .expect("open database");
    let storage = Arc::new(SandboxStorage::new(pool));
    let account = storage
        .create_account(NewAccount {
            username: unique_name("it"),
            is_admin: false,
            limits: Resources {
                cpu: 2,
                memory_mb: 2048,
                disk_mb: 10240,
            },
        })
        .await
        .unwrap();
    let caller = Caller::account(account.id);

    // alpine has no apt, so provisioning fails while the instance stays up
    let manager = SandboxManager::new(
        storage.clone(),
        runtime.clone(),
        ManagerConfig {
            image: TEST_IMAGE.to_string(),
            name_prefix: unique_name("sbpanel-it"),
            ..Default::default()
        },
    );

    let sandbox = manager
        .create_sandbox(CreateSandboxRequest {
            name: "web1".to_string(),
            template: "nginx".to_string(),
            owner_id: account.id,
            resources: Resources {
                cpu: 1,
                memory_mb: 256,
                disk_mb: 1024,
            },
        })
        .await
        .expect("create sandbox");
    let runtime_id = sandbox.runtime_id.clone().expect("runtime id recorded");

    tokio::time::timeout(Duration::from_secs(300), manager.wait_for_provisioning())
        .await
        .expect("provisioning did not settle");

    let view = manager.get_sandbox_status(sandbox.id, caller).await.unwrap();
    assert_eq!(view.sandbox.status, SandboxStatus::ErrorProvisioning);
    assert_eq!(view.live_state, Some(InstanceState::Running));

    let report = manager.delete_sandbox(sandbox.id, caller).await.unwrap();
    assert!(report.runtime_removed);
    assert!(runtime.state(&runtime_id).await.unwrap_err().is_not_found());

    manager.shutdown().await;
}
