// ABOUTME: Let's Encrypt certificates through certbot's standalone authenticator
// ABOUTME: Issues certificates, installs automatic renewal and reports expiry

use super::{validate_domain, Result};
use crate::executor::CommandExecutor;
use crate::files::{FileError, FileManager};
use crate::templates::{WebServer, CRON_SERVICE};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

pub const CERT_VALIDITY_DAYS: i64 = 90;
pub const RENEWAL_THRESHOLD_DAYS: i64 = 30;

const RENEWAL_CRON_PATH: &str = "/etc/cron.d/sbpanel-certbot-renew";
const RENEWAL_CRON_LINE: &str = "0 0,12 * * * root certbot renew --quiet\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CertificateStatus {
    pub expires_at: DateTime<Utc>,
    pub needs_renewal: bool,
}

impl CertificateStatus {
    pub fn at(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            expires_at,
            needs_renewal: expires_at - now <= Duration::days(RENEWAL_THRESHOLD_DAYS),
        }
    }
}

pub fn certbot_command(domain: &str, email: Option<&str>) -> Vec<String> {
    let mut argv: Vec<String> = [
        "certbot",
        "certonly",
        "--standalone",
        "--non-interactive",
        "--agree-tos",
        "-d",
        domain,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    match email.filter(|e| !e.trim().is_empty()) {
        Some(email) => {
            argv.push("-m".to_string());
            argv.push(email.trim().to_string());
        }
        None => argv.push("--register-unsafely-without-email".to_string()),
    }
    argv
}

/// Pull the first `Expiry Date:` out of `certbot certificates` output
pub fn parse_expiry(output: &str) -> Option<DateTime<Utc>> {
    let value = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Expiry Date:"))?
        .trim();
    let value = value.split(" (").next().unwrap_or(value).trim();

    if let Ok(parsed) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Clone)]
pub struct TlsProvisioner {
    executor: CommandExecutor,
    files: FileManager,
}

impl TlsProvisioner {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            files: FileManager::new(executor.clone()),
            executor,
        }
    }

    /// Obtain a certificate for `domain`, returning when it expires
    ///
    /// The web server is stopped to free port 80 and started again whether or
    /// not certbot succeeds.
    pub async fn request(
        &self,
        runtime_id: &str,
        domain: &str,
        email: Option<&str>,
        web_server: WebServer,
    ) -> Result<DateTime<Utc>> {
        validate_domain(domain)?;

        self.executor
            .ensure_packages(runtime_id, &["certbot"])
            .await?;

        self.executor
            .stop_service(runtime_id, web_server.service_name())
            .await;
        let issued = self
            .executor
            .run(runtime_id, &certbot_command(domain, email))
            .await;
        if !self
            .executor
            .start_service(runtime_id, web_server.service_name())
            .await
            .applied()
        {
            warn!(runtime_id = %runtime_id, server = %web_server.service_name(), "Web server did not come back after certbot");
        }

        if let Err(e) = issued {
            error!(runtime_id = %runtime_id, domain = %domain, error = %e, "Certificate request failed");
            return Err(e.into());
        }

        self.install_renewal(runtime_id).await?;

        let expires_at = Utc::now() + Duration::days(CERT_VALIDITY_DAYS);
        info!(runtime_id = %runtime_id, domain = %domain, expires_at = %expires_at, "Certificate issued");
        Ok(expires_at)
    }

    /// Current expiry for `domain`, `None` when certbot knows no such certificate
    pub async fn check_expiry(
        &self,
        runtime_id: &str,
        domain: &str,
    ) -> Result<Option<CertificateStatus>> {
        validate_domain(domain)?;

        let output = self
            .executor
            .run(runtime_id, &["certbot", "certificates", "-d", domain])
            .await?;

        Ok(parse_expiry(&output.stdout).map(|expires_at| CertificateStatus::at(expires_at, Utc::now())))
    }

    async fn install_renewal(&self, runtime_id: &str) -> Result<()> {
        let existing = match self.files.read_file(runtime_id, RENEWAL_CRON_PATH).await {
            Ok(content) => content,
            Err(FileError::NotFound(_)) => String::new(),
            Err(e) => return Err(e.into()),
        };
        if existing.contains("certbot renew") {
            return Ok(());
        }

        self.files
            .write_file(runtime_id, RENEWAL_CRON_PATH, RENEWAL_CRON_LINE.as_bytes())
            .await?;
        self.executor
            .run(runtime_id, &["chmod", "0644", RENEWAL_CRON_PATH])
            .await?;
        self.executor
            .restart_service(runtime_id, CRON_SERVICE.name)
            .await;
        info!(runtime_id = %runtime_id, "Certificate renewal scheduled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const CERTIFICATES: &str = "Found the following certs:\n  \
        Certificate Name: example.com\n    \
        Domains: example.com\n    \
        Expiry Date: 2026-12-01 08:30:00+00:00 (VALID: 45 days)\n    \
        Certificate Path: /etc/letsencrypt/live/example.com/fullchain.pem\n";

    fn setup() -> (Arc<FakeRuntime>, TlsProvisioner) {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.insert_stray("rt-1", "sbpanel-u1-web1", Some(1));
        let provisioner = TlsProvisioner::new(CommandExecutor::new(runtime.clone()));
        (runtime, provisioner)
    }

    #[test]
    fn test_certbot_command_with_and_without_email() {
        let with = certbot_command("example.com", Some("ops@example.com"));
        assert_eq!(&with[with.len() - 2..], ["-m", "ops@example.com"]);

        let without = certbot_command("example.com", Some("  "));
        assert_eq!(without.last().unwrap(), "--register-unsafely-without-email");
        assert_eq!(without[..7].join(" "), "certbot certonly --standalone --non-interactive --agree-tos -d example.com");
    }

    #[test]
    fn test_parse_expiry() {
        assert_eq!(
            parse_expiry(CERTIFICATES),
            Some(Utc.with_ymd_and_hms(2026, 12, 1, 8, 30, 0).unwrap())
        );
        assert_eq!(
            parse_expiry("Expiry Date: 2026-12-01 08:30:00"),
            Some(Utc.with_ymd_and_hms(2026, 12, 1, 8, 30, 0).unwrap())
        );
        assert_eq!(parse_expiry("No certificates found."), None);
    }

    #[test]
    fn test_renewal_threshold() {
        let now = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        assert!(CertificateStatus::at(now + Duration::days(10), now).needs_renewal);
        assert!(CertificateStatus::at(now + Duration::days(30), now).needs_renewal);
        assert!(!CertificateStatus::at(now + Duration::days(60), now).needs_renewal);
    }

    #[tokio::test]
    async fn test_request_stops_and_restarts_web_server() {
        let (runtime, provisioner) = setup();

        let before = Utc::now();
        let expires_at = provisioner
            .request("rt-1", "example.com", None, WebServer::Nginx)
            .await
            .unwrap();

        assert!(expires_at >= before + Duration::days(CERT_VALIDITY_DAYS));
        let calls = runtime.exec_calls();
        let stop = calls.iter().position(|c| c == "service nginx stop").unwrap();
        let certbot = calls.iter().position(|c| c.starts_with("certbot certonly")).unwrap();
        let start = calls.iter().position(|c| c == "service nginx start").unwrap();
        assert!(stop < certbot && certbot < start);
    }

    #[tokio::test]
    async fn test_failed_request_still_restarts_web_server() {
        let (runtime, provisioner) = setup();
        runtime.respond("certbot certonly", 1, "", "Problem binding to port 80");

        let result = provisioner
            .request("rt-1", "example.com", Some("ops@example.com"), WebServer::Apache)
            .await;

        assert!(result.is_err());
        assert!(runtime.exec_calls().contains(&"service apache2 start".to_string()));
        assert!(runtime.file("rt-1", RENEWAL_CRON_PATH).is_none());
    }

    #[tokio::test]
    async fn test_renewal_cron_written_once() {
        let (runtime, provisioner) = setup();

        provisioner
            .request("rt-1", "example.com", None, WebServer::Nginx)
            .await
            .unwrap();
        assert_eq!(
            runtime.file("rt-1", RENEWAL_CRON_PATH).unwrap(),
            RENEWAL_CRON_LINE.as_bytes().to_vec()
        );

        runtime.respond(
            &format!("cat {}", RENEWAL_CRON_PATH),
            0,
            RENEWAL_CRON_LINE,
            "",
        );
        provisioner
            .request("rt-1", "second.example.com", None, WebServer::Nginx)
            .await
            .unwrap();
        assert_eq!(
            runtime
                .calls_starting_with(&format!("copy_in rt-1 {}", RENEWAL_CRON_PATH))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_check_expiry() {
        let (runtime, provisioner) = setup();
        runtime.respond("certbot certificates", 0, CERTIFICATES, "");

        let status = provisioner
            .check_expiry("rt-1", "example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.expires_at, Utc.with_ymd_and_hms(2026, 12, 1, 8, 30, 0).unwrap());
    }
}
