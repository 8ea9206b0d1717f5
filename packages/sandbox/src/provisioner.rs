// ABOUTME: Software provisioner installing a template's packages inside a sandbox
// ABOUTME: Refreshes the package index, installs in one batch and starts services in order

use crate::executor::{apt_get, CommandExecutor, ExecError, ServiceOutcome};
use crate::templates::{install_plan, ServiceSpec, Template};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Failed to refresh package index: {0}")]
    PackageIndex(#[source] ExecError),

    #[error("Failed to install packages: {0}")]
    Install(#[source] ExecError),

    #[error("Runtime instance {0} is not running after provisioning")]
    NotRunning(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// A template service together with the result of starting it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedService {
    pub spec: ServiceSpec,
    pub outcome: ServiceOutcome,
}

#[derive(Clone)]
pub struct SoftwareProvisioner {
    executor: CommandExecutor,
}

impl SoftwareProvisioner {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    /// Install and start the software for `template_tag` inside the instance
    pub async fn provision(
        &self,
        runtime_id: &str,
        template_tag: &str,
    ) -> Result<Vec<ProvisionedService>> {
        let template = Template::from_tag(template_tag);
        if template.is_none() {
            warn!(
                runtime_id = %runtime_id,
                template = %template_tag,
                "Unknown template, installing base packages only"
            );
        }
        let (packages, services) = install_plan(template);

        info!(runtime_id = %runtime_id, template = %template_tag, "Refreshing package index");
        self.executor
            .run(runtime_id, &apt_get(&["update", "-y"]))
            .await
            .map_err(ProvisionError::PackageIndex)?;

        info!(
            runtime_id = %runtime_id,
            count = packages.len(),
            "Installing packages"
        );
        let mut args = vec!["install", "-y"];
        args.extend(packages);
        self.executor
            .run(runtime_id, &apt_get(&args))
            .await
            .map_err(ProvisionError::Install)?;

        let mut started = Vec::with_capacity(services.len());
        for spec in services {
            let outcome = self.executor.start_service(runtime_id, spec.name).await;
            started.push(ProvisionedService { spec, outcome });
        }

        Ok(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn setup() -> (Arc<FakeRuntime>, SoftwareProvisioner) {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.insert_stray("rt-1", "sbpanel-u1-web1", Some(1));
        let provisioner = SoftwareProvisioner::new(CommandExecutor::new(runtime.clone()));
        (runtime, provisioner)
    }

    #[tokio::test]
    async fn test_provision_nginx_runs_update_install_then_services() {
        let (runtime, provisioner) = setup();

        let services = provisioner.provision("rt-1", "nginx").await.unwrap();

        let names: Vec<_> = services.iter().map(|s| s.spec.name).collect();
        assert_eq!(names, vec!["nginx", "php7.4-fpm", "cron"]);
        assert!(services.iter().all(|s| s.outcome.applied()));

        let calls = runtime.exec_calls();
        assert_eq!(
            calls[0],
            "env DEBIAN_FRONTEND=noninteractive apt-get update -y"
        );
        assert!(calls[1].starts_with(
            "env DEBIAN_FRONTEND=noninteractive apt-get install -y curl wget cron procps net-tools nginx"
        ));
        assert_eq!(calls[2], "service nginx start");
        assert_eq!(calls.last().unwrap(), "service cron start");
    }

    #[tokio::test]
    async fn test_unknown_template_installs_base_packages_only() {
        let (runtime, provisioner) = setup();

        let services = provisioner.provision("rt-1", "lamp-deluxe").await.unwrap();

        assert_eq!(services.len(), 1);
        assert_eq!(services[0].spec.name, "cron");
        assert!(runtime.exec_calls().contains(
            &"env DEBIAN_FRONTEND=noninteractive apt-get install -y curl wget cron procps net-tools"
                .to_string()
        ));
    }

    #[tokio::test]
    async fn test_install_failure_is_provision_error() {
        let (runtime, provisioner) = setup();
        runtime.respond(
            "env DEBIAN_FRONTEND=noninteractive apt-get install",
            100,
            "",
            "E: Unable to locate package",
        );

        let err = provisioner.provision("rt-1", "apache").await.unwrap_err();

        assert!(matches!(err, ProvisionError::Install(_)));
        assert!(runtime.calls_starting_with("exec service").is_empty());
    }

    #[tokio::test]
    async fn test_index_refresh_failure_stops_before_install() {
        let (runtime, provisioner) = setup();
        runtime.respond(
            "env DEBIAN_FRONTEND=noninteractive apt-get update",
            100,
            "",
            "Temporary failure resolving",
        );

        let err = provisioner.provision("rt-1", "nginx").await.unwrap_err();

        assert!(matches!(err, ProvisionError::PackageIndex(_)));
        assert_eq!(runtime.exec_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_service_start_does_not_fail_provisioning() {
        let (runtime, provisioner) = setup();
        runtime.respond("service php7.4-fpm start", 1, "", "");
        runtime.respond("systemctl start php7.4-fpm", 1, "", "");

        let services = provisioner.provision("rt-1", "nginx").await.unwrap();

        let fpm = services.iter().find(|s| s.spec.name == "php7.4-fpm").unwrap();
        assert_eq!(fpm.outcome, ServiceOutcome::Failed);
    }
}
