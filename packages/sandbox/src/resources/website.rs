// ABOUTME: Website provisioning rendering nginx and apache virtual hosts
// ABOUTME: Creates the document root, enables the site and restarts the web server

use super::{validate_domain, Result};
use crate::executor::{CommandExecutor, ExecOptions};
use crate::files::FileManager;
use crate::templates::WebServer;
use tracing::{info, warn};

/// Everything needed to render and install one virtual host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub domain: String,
    pub server: WebServer,
    /// PHP version served through FPM; `None` serves static files only
    pub php_version: Option<String>,
    pub document_root: String,
    pub ssl_enabled: bool,
}

pub fn default_document_root(domain: &str) -> String {
    format!("/var/www/{}", domain)
}

fn nginx_available(domain: &str) -> String {
    format!("/etc/nginx/sites-available/{}", domain)
}

fn nginx_enabled(domain: &str) -> String {
    format!("/etc/nginx/sites-enabled/{}", domain)
}

fn apache_available(domain: &str) -> String {
    format!("/etc/apache2/sites-available/{}.conf", domain)
}

pub fn render_index_page(domain: &str, document_root: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Welcome to {domain}</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; line-height: 1.6; }}
        h1 {{ color: #2c3e50; }}
        .info {{ background-color: #f5f5f5; padding: 20px; border-radius: 5px; }}
    </style>
</head>
<body>
    <h1>Welcome to {domain}</h1>
    <div class="info">
        <p>This website is hosted on SBPanel.</p>
        <p>Upload your website files to the document root:</p>
        <code>{document_root}</code>
    </div>
</body>
</html>
"#
    )
}

fn nginx_server_block(config: &SiteConfig, tls: bool) -> String {
    let domain = &config.domain;
    let root = &config.document_root;
    let mut block = String::from("server {\n");

    if tls {
        block.push_str("    listen 443 ssl;\n");
    } else {
        block.push_str("    listen 80;\n");
    }
    block.push_str(&format!(
        "    server_name {domain};\n    root {root};\n    index index.html index.php;\n\n"
    ));
    if tls {
        block.push_str(&format!(
            "    ssl_certificate /etc/letsencrypt/live/{domain}/fullchain.pem;\n    \
             ssl_certificate_key /etc/letsencrypt/live/{domain}/privkey.pem;\n    \
             ssl_protocols TLSv1.2 TLSv1.3;\n    \
             ssl_prefer_server_ciphers on;\n\n"
        ));
    }
    block.push_str(&format!(
        "    access_log /var/log/nginx/{domain}_access.log;\n    \
         error_log /var/log/nginx/{domain}_error.log;\n\n    \
         location / {{\n        try_files $uri $uri/ /index.php?$args;\n    }}\n"
    ));
    if let Some(php) = &config.php_version {
        block.push_str(&format!(
            "\n    location ~ \\.php$ {{\n        \
             include snippets/fastcgi-php.conf;\n        \
             fastcgi_pass unix:/var/run/php/php{php}-fpm.sock;\n    }}\n"
        ));
    }
    block.push_str("\n    location ~ /\\.ht {\n        deny all;\n    }\n}\n");
    block
}

pub fn render_nginx(config: &SiteConfig) -> String {
    let mut rendered = nginx_server_block(config, false);
    if config.ssl_enabled {
        rendered.push('\n');
        rendered.push_str(&nginx_server_block(config, true));
    }
    rendered
}

pub fn render_apache(config: &SiteConfig) -> String {
    let domain = &config.domain;
    let root = &config.document_root;
    let directory = format!(
        "    <Directory {root}>\n        Options Indexes FollowSymLinks\n        \
         AllowOverride All\n        Require all granted\n    </Directory>\n"
    );

    let mut rendered = format!(
        "<VirtualHost *:80>\n    ServerName {domain}\n    DocumentRoot {root}\n\n{directory}\n    \
         ErrorLog ${{APACHE_LOG_DIR}}/{domain}_error.log\n    \
         CustomLog ${{APACHE_LOG_DIR}}/{domain}_access.log combined\n</VirtualHost>\n"
    );
    if config.ssl_enabled {
        rendered.push_str(&format!(
            "\n<VirtualHost *:443>\n    ServerName {domain}\n    DocumentRoot {root}\n\n    \
             SSLEngine on\n    \
             SSLCertificateFile /etc/letsencrypt/live/{domain}/fullchain.pem\n    \
             SSLCertificateKeyFile /etc/letsencrypt/live/{domain}/privkey.pem\n\n{directory}\n    \
             ErrorLog ${{APACHE_LOG_DIR}}/{domain}_ssl_error.log\n    \
             CustomLog ${{APACHE_LOG_DIR}}/{domain}_ssl_access.log combined\n</VirtualHost>\n"
        ));
    }
    rendered
}

#[derive(Clone)]
pub struct WebsiteProvisioner {
    executor: CommandExecutor,
    files: FileManager,
}

impl WebsiteProvisioner {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            files: FileManager::new(executor.clone()),
            executor,
        }
    }

    /// Create the document root with a placeholder page and install the virtual host
    pub async fn create(&self, runtime_id: &str, config: &SiteConfig) -> Result<()> {
        validate_domain(&config.domain)?;

        self.files
            .create_directory(runtime_id, &config.document_root)
            .await?;
        let index = format!("{}/index.html", config.document_root.trim_end_matches('/'));
        self.files
            .write_file(
                runtime_id,
                &index,
                render_index_page(&config.domain, &config.document_root).as_bytes(),
            )
            .await?;

        self.configure(runtime_id, config).await
    }

    /// Write the virtual host for `config.domain`, leaving site content alone
    pub async fn configure(&self, runtime_id: &str, config: &SiteConfig) -> Result<()> {
        validate_domain(&config.domain)?;

        match config.server {
            WebServer::Nginx => self.install_nginx(runtime_id, config).await?,
            WebServer::Apache => self.install_apache(runtime_id, config).await?,
        }

        self.executor
            .restart_service(runtime_id, config.server.service_name())
            .await;
        info!(
            runtime_id = %runtime_id,
            domain = %config.domain,
            server = config.server.as_str(),
            "Website configured"
        );
        Ok(())
    }

    async fn install_nginx(&self, runtime_id: &str, config: &SiteConfig) -> Result<()> {
        if let Some(php) = &config.php_version {
            let fpm = format!("php{}-fpm", php);
            self.executor
                .ensure_packages(runtime_id, &[fpm.as_str()])
                .await?;
            self.executor.restart_service(runtime_id, &fpm).await;
        }

        let available = nginx_available(&config.domain);
        let enabled = nginx_enabled(&config.domain);
        self.files
            .write_file(runtime_id, &available, render_nginx(config).as_bytes())
            .await?;
        self.executor
            .run(runtime_id, &["rm", "-f", enabled.as_str()])
            .await?;
        self.executor
            .run(runtime_id, &["ln", "-s", available.as_str(), enabled.as_str()])
            .await?;
        Ok(())
    }

    async fn install_apache(&self, runtime_id: &str, config: &SiteConfig) -> Result<()> {
        if config.ssl_enabled {
            self.executor.run(runtime_id, &["a2enmod", "ssl"]).await?;
        }

        let site = format!("{}.conf", config.domain);
        self.files
            .write_file(
                runtime_id,
                &apache_available(&config.domain),
                render_apache(config).as_bytes(),
            )
            .await?;
        self.executor
            .exec(runtime_id, &["a2dissite", site.as_str()], ExecOptions::lenient())
            .await?;
        self.executor
            .run(runtime_id, &["a2ensite", site.as_str()])
            .await?;
        Ok(())
    }

    /// Remove whichever virtual host exists for `domain`, returning the servers touched
    pub async fn delete(&self, runtime_id: &str, domain: &str) -> Result<Vec<WebServer>> {
        validate_domain(domain)?;
        let mut removed = Vec::new();

        let available = nginx_available(domain);
        if self.exists(runtime_id, &available).await? {
            let enabled = nginx_enabled(domain);
            self.executor
                .run(runtime_id, &["rm", "-f", enabled.as_str()])
                .await?;
            self.files.delete_path(runtime_id, &available).await?;
            self.executor
                .restart_service(runtime_id, WebServer::Nginx.service_name())
                .await;
            removed.push(WebServer::Nginx);
        }

        let available = apache_available(domain);
        if self.exists(runtime_id, &available).await? {
            let site = format!("{}.conf", domain);
            self.executor
                .exec(runtime_id, &["a2dissite", site.as_str()], ExecOptions::lenient())
                .await?;
            self.files.delete_path(runtime_id, &available).await?;
            self.executor
                .restart_service(runtime_id, WebServer::Apache.service_name())
                .await;
            removed.push(WebServer::Apache);
        }

        if removed.is_empty() {
            warn!(runtime_id = %runtime_id, domain = %domain, "No website configuration found to delete");
        }
        Ok(removed)
    }

    async fn exists(&self, runtime_id: &str, path: &str) -> Result<bool> {
        let probe = self
            .executor
            .exec(runtime_id, &["test", "-f", path], ExecOptions::lenient())
            .await?;
        Ok(probe.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use std::sync::Arc;

    fn config(server: WebServer, ssl_enabled: bool) -> SiteConfig {
        SiteConfig {
            domain: "example.com".to_string(),
            server,
            php_version: Some("7.4".to_string()),
            document_root: default_document_root("example.com"),
            ssl_enabled,
        }
    }

    fn setup() -> (Arc<FakeRuntime>, WebsiteProvisioner) {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.insert_stray("rt-1", "sbpanel-u1-web1", Some(1));
        let provisioner = WebsiteProvisioner::new(CommandExecutor::new(runtime.clone()));
        (runtime, provisioner)
    }

    #[test]
    fn test_render_nginx_with_and_without_tls() {
        let plain = render_nginx(&config(WebServer::Nginx, false));
        assert!(plain.contains("listen 80;"));
        assert!(plain.contains("root /var/www/example.com;"));
        assert!(plain.contains("fastcgi_pass unix:/var/run/php/php7.4-fpm.sock;"));
        assert!(!plain.contains("listen 443"));

        let tls = render_nginx(&config(WebServer::Nginx, true));
        assert!(tls.contains("listen 443 ssl;"));
        assert!(tls.contains("/etc/letsencrypt/live/example.com/fullchain.pem"));
    }

    #[test]
    fn test_render_apache_includes_ssl_vhost_only_when_enabled() {
        let plain = render_apache(&config(WebServer::Apache, false));
        assert!(plain.contains("<VirtualHost *:80>"));
        assert!(plain.contains("${APACHE_LOG_DIR}/example.com_error.log"));
        assert!(!plain.contains("SSLEngine"));

        let tls = render_apache(&config(WebServer::Apache, true));
        assert!(tls.contains("<VirtualHost *:443>"));
        assert!(tls.contains("SSLEngine on"));
    }

    #[tokio::test]
    async fn test_create_nginx_site_writes_and_enables_config() {
        let (runtime, provisioner) = setup();

        provisioner
            .create("rt-1", &config(WebServer::Nginx, false))
            .await
            .unwrap();

        assert!(runtime.file("rt-1", "/var/www/example.com/index.html").is_some());
        let vhost = runtime
            .file("rt-1", "/etc/nginx/sites-available/example.com")
            .unwrap();
        assert!(String::from_utf8(vhost).unwrap().contains("server_name example.com;"));

        let calls = runtime.exec_calls();
        assert!(calls.contains(
            &"ln -s /etc/nginx/sites-available/example.com /etc/nginx/sites-enabled/example.com"
                .to_string()
        ));
        assert_eq!(calls.last().unwrap(), "service nginx restart");
    }

    #[tokio::test]
    async fn test_create_apache_site_with_tls_enables_ssl_module() {
        let (runtime, provisioner) = setup();

        provisioner
            .create("rt-1", &config(WebServer::Apache, true))
            .await
            .unwrap();

        let calls = runtime.exec_calls();
        assert!(calls.contains(&"a2enmod ssl".to_string()));
        assert!(calls.contains(&"a2ensite example.com.conf".to_string()));
        assert!(runtime
            .file("rt-1", "/etc/apache2/sites-available/example.com.conf")
            .is_some());
        assert_eq!(calls.last().unwrap(), "service apache2 restart");
    }

    #[tokio::test]
    async fn test_delete_removes_only_existing_config() {
        let (runtime, provisioner) = setup();
        runtime.respond("test -f /etc/apache2/sites-available/example.com.conf", 1, "", "");

        let removed = provisioner.delete("rt-1", "example.com").await.unwrap();

        assert_eq!(removed, vec![WebServer::Nginx]);
        let calls = runtime.exec_calls();
        assert!(calls.contains(&"rm -rf /etc/nginx/sites-available/example.com".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("a2dissite")));
    }

    #[tokio::test]
    async fn test_invalid_domain_is_rejected_before_exec() {
        let (runtime, provisioner) = setup();
        let mut bad = config(WebServer::Nginx, false);
        bad.domain = "evil.com;reboot".to_string();

        assert!(provisioner.create("rt-1", &bad).await.is_err());
        assert!(runtime.exec_calls().is_empty());
    }
}
