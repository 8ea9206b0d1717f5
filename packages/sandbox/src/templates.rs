// ABOUTME: Static software templates mapping a template tag to packages and services
// ABOUTME: New templates are added as enum variants so every lookup stays exhaustive

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const PHP_VERSION: &str = "7.4";

/// Packages installed into every sandbox regardless of template
pub const BASE_PACKAGES: &[&str] = &["curl", "wget", "cron", "procps", "net-tools"];

/// Scheduler service started last in every sandbox
pub const CRON_SERVICE: ServiceSpec = ServiceSpec {
    name: "cron",
    kind: ServiceKind::Scheduler,
    port: None,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    Nginx,
    Apache,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Web,
    Runtime,
    Database,
    Cache,
    Scheduler,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Runtime => "runtime",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Scheduler => "scheduler",
        }
    }
}

/// A daemon implied by a template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: &'static str,
    pub kind: ServiceKind,
    pub port: Option<u16>,
}

const NGINX: ServiceSpec = ServiceSpec {
    name: "nginx",
    kind: ServiceKind::Web,
    port: Some(80),
};
const PHP_FPM: ServiceSpec = ServiceSpec {
    name: "php7.4-fpm",
    kind: ServiceKind::Runtime,
    port: None,
};
const APACHE: ServiceSpec = ServiceSpec {
    name: "apache2",
    kind: ServiceKind::Web,
    port: Some(80),
};
const MARIADB: ServiceSpec = ServiceSpec {
    name: "mariadb",
    kind: ServiceKind::Database,
    port: Some(3306),
};
const REDIS: ServiceSpec = ServiceSpec {
    name: "redis-server",
    kind: ServiceKind::Cache,
    port: Some(6379),
};

impl Template {
    pub const ALL: [Template; 3] = [Template::Nginx, Template::Apache, Template::Mixed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nginx => "nginx",
            Self::Apache => "apache",
            Self::Mixed => "mixed",
        }
    }

    /// Resolve a persisted template tag. Unknown tags resolve to `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        tag.parse().ok()
    }

    pub fn packages(&self) -> &'static [&'static str] {
        match self {
            Self::Nginx => &[
                "nginx",
                "php7.4-fpm",
                "php7.4-mysql",
                "php7.4-curl",
                "php7.4-gd",
                "php7.4-mbstring",
                "php7.4-xml",
                "mysql-client",
            ],
            Self::Apache => &[
                "apache2",
                "libapache2-mod-php7.4",
                "php7.4-mysql",
                "mysql-client",
            ],
            Self::Mixed => &[
                "nginx",
                "php7.4-fpm",
                "php7.4-mysql",
                "mariadb-server",
                "redis-server",
                "mysql-client",
            ],
        }
    }

    /// Services in the order they must be started
    pub fn services(&self) -> &'static [ServiceSpec] {
        match self {
            Self::Nginx => &[NGINX, PHP_FPM],
            Self::Apache => &[APACHE],
            Self::Mixed => &[NGINX, PHP_FPM, MARIADB, REDIS],
        }
    }

    /// The web server fronting sites in this template
    pub fn web_server(&self) -> WebServer {
        match self {
            Self::Nginx | Self::Mixed => WebServer::Nginx,
            Self::Apache => WebServer::Apache,
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Template {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nginx" => Ok(Self::Nginx),
            "apache" => Ok(Self::Apache),
            "mixed" => Ok(Self::Mixed),
            other => Err(format!("Unknown template: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebServer {
    Nginx,
    Apache,
}

impl WebServer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nginx => "nginx",
            Self::Apache => "apache",
        }
    }

    pub fn service_name(&self) -> &'static str {
        match self {
            Self::Nginx => "nginx",
            Self::Apache => "apache2",
        }
    }
}

impl FromStr for WebServer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nginx" => Ok(Self::Nginx),
            "apache" | "apache2" => Ok(Self::Apache),
            other => Err(format!("Unknown web server: {}", other)),
        }
    }
}

/// Full install plan for a template tag: base packages plus the template's own
pub fn install_plan(template: Option<Template>) -> (Vec<&'static str>, Vec<ServiceSpec>) {
    let mut packages = BASE_PACKAGES.to_vec();
    let mut services = Vec::new();

    if let Some(template) = template {
        packages.extend_from_slice(template.packages());
        services.extend_from_slice(template.services());
    }
    services.push(CRON_SERVICE);

    (packages, services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("nginx", Some(Template::Nginx))]
    #[case("Apache", Some(Template::Apache))]
    #[case(" mixed ", Some(Template::Mixed))]
    #[case("wordpress", None)]
    #[case("", None)]
    fn test_from_tag(#[case] tag: &str, #[case] expected: Option<Template>) {
        assert_eq!(Template::from_tag(tag), expected);
    }

    #[test]
    fn test_unknown_template_plan_is_base_only() {
        let (packages, services) = install_plan(None);
        assert_eq!(packages, BASE_PACKAGES.to_vec());
        assert_eq!(services, vec![CRON_SERVICE]);
    }

    #[test]
    fn test_mixed_plan_starts_cron_last() {
        let (packages, services) = install_plan(Some(Template::Mixed));

        assert!(packages.contains(&"mariadb-server"));
        assert!(packages.starts_with(BASE_PACKAGES));
        let names: Vec<_> = services.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["nginx", "php7.4-fpm", "mariadb", "redis-server", "cron"]
        );
    }

    #[test]
    fn test_every_template_has_a_web_service() {
        for template in Template::ALL {
            let web = template.web_server().service_name();
            assert!(template.services().iter().any(|s| s.name == web));
        }
    }
}
