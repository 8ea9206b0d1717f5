// ABOUTME: Provisioners for hosted resources living inside a running sandbox
// ABOUTME: Websites, databases, scheduled jobs and TLS certificates driven through exec

use crate::executor::ExecError;
use crate::files::FileError;
use thiserror::Error;

pub mod cron;
pub mod database;
pub mod tls;
pub mod website;

pub use cron::CronProvisioner;
pub use database::{DatabaseEngine, DatabaseProvisioner, DatabaseSpec};
pub use tls::{CertificateStatus, TlsProvisioner};
pub use website::{SiteConfig, WebsiteProvisioner};

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Files(#[from] FileError),
}

impl ResourceError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ResourceError::Invalid {
            field,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ResourceError>;

/// Accept lowercase-insensitive DNS names made of letters, digits and hyphens
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.len() > 253 {
        return Err(ResourceError::invalid("domain", "must be 1 to 253 characters"));
    }

    for label in domain.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(ResourceError::invalid(
                "domain",
                format!("'{}' is not a valid host name", domain),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example.com")]
    #[case("www.my-site.example.org")]
    #[case("localhost")]
    fn test_valid_domains(#[case] domain: &str) {
        assert!(validate_domain(domain).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("-bad.com")]
    #[case("bad-.com")]
    #[case("a..b")]
    #[case("../etc/passwd")]
    #[case("evil.com; rm -rf /")]
    fn test_invalid_domains(#[case] domain: &str) {
        assert!(validate_domain(domain).is_err());
    }
}
