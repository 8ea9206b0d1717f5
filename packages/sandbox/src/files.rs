// ABOUTME: File browsing and transfer inside sandboxes built on exec and archive copy
// ABOUTME: Parses `ls --full-time` listings and guards destructive paths

use crate::executor::{CommandExecutor, ExecError, ExecOptions};
use crate::runtime::RuntimeError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum FileError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Download of {url} failed: {message}")]
    DownloadFailed { url: String, message: String },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, FileError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    fn from_mode(mode: &str) -> Self {
        match mode.chars().next() {
            Some('-') => FileKind::File,
            Some('d') => FileKind::Directory,
            Some('l') => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub modified: Option<DateTime<Utc>>,
    /// Target of a symlink
    pub target: Option<String>,
}

/// Parse the output of `ls -la --full-time`, skipping `.` and `..`
pub fn parse_listing(dir: &str, output: &str) -> Vec<FileEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("total "))
        .filter_map(|line| {
            let entry = parse_listing_line(dir, line);
            if entry.is_none() {
                debug!(line = %line, "Skipping unparseable listing line");
            }
            entry
        })
        .filter(|entry| entry.name != "." && entry.name != "..")
        .collect()
}

fn parse_listing_line(dir: &str, line: &str) -> Option<FileEntry> {
    // mode links owner group size date time zone name...
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(8);
    for _ in 0..8 {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() {
        return None;
    }

    let kind = FileKind::from_mode(fields[0]);
    let (name, target) = match (kind, rest.split_once(" -> ")) {
        (FileKind::Symlink, Some((name, target))) => (name.to_string(), Some(target.to_string())),
        _ => (rest.to_string(), None),
    };

    let modified = DateTime::parse_from_str(
        &format!("{} {} {}", fields[5], fields[6], fields[7]),
        "%Y-%m-%d %H:%M:%S%.f %z",
    )
    .ok()
    .map(|ts| ts.with_timezone(&Utc));

    Some(FileEntry {
        path: join_path(dir, &name),
        name,
        kind,
        size: fields[4].parse().unwrap_or(0),
        permissions: fields[0].to_string(),
        owner: fields[2].to_string(),
        group: fields[3].to_string(),
        modified,
        target,
    })
}

fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn parent_dir(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

fn validate_path(path: &str) -> Result<&str> {
    if path.is_empty() || !path.starts_with('/') || path.contains('\0') {
        return Err(FileError::InvalidPath(path.to_string()));
    }
    Ok(path)
}

fn is_missing(err: &ExecError) -> bool {
    matches!(err, ExecError::CommandFailed { stderr, .. } if stderr.contains("No such file or directory"))
}

/// Name a download is stored under, derived from the last URL path segment
fn download_name(url: &url::Url) -> String {
    let raw = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("downloaded_file");

    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File operations scoped to one runtime instance at a time
#[derive(Clone)]
pub struct FileManager {
    executor: CommandExecutor,
}

impl FileManager {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    pub async fn list_directory(&self, runtime_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let path = validate_path(path)?;
        let dir = format!("{}/", path.trim_end_matches('/'));

        let output = self
            .executor
            .run(runtime_id, &["ls", "-la", "--full-time", dir.as_str()])
            .await
            .map_err(|e| {
                if is_missing(&e) {
                    FileError::NotFound(path.to_string())
                } else {
                    e.into()
                }
            })?;

        Ok(parse_listing(path, &output.stdout))
    }

    pub async fn read_file(&self, runtime_id: &str, path: &str) -> Result<String> {
        let path = validate_path(path)?;
        let output = self
            .executor
            .run(runtime_id, &["cat", path])
            .await
            .map_err(|e| {
                if is_missing(&e) {
                    FileError::NotFound(path.to_string())
                } else {
                    e.into()
                }
            })?;
        Ok(output.stdout)
    }

    /// Write `contents` to `path`, creating parent directories as needed
    pub async fn write_file(&self, runtime_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        if path.ends_with('/') {
            return Err(FileError::InvalidPath(path.to_string()));
        }

        if let Some(parent) = parent_dir(path).filter(|p| *p != "/") {
            self.executor.run(runtime_id, &["mkdir", "-p", parent]).await?;
        }
        self.executor
            .runtime()
            .copy_in(runtime_id, contents, path)
            .await?;

        info!(runtime_id = %runtime_id, path = %path, bytes = contents.len(), "File written");
        Ok(())
    }

    pub async fn create_directory(&self, runtime_id: &str, path: &str) -> Result<()> {
        let path = validate_path(path)?;
        self.executor.run(runtime_id, &["mkdir", "-p", path]).await?;
        Ok(())
    }

    /// Recursively delete `path`; the root directory is refused
    pub async fn delete_path(&self, runtime_id: &str, path: &str) -> Result<()> {
        let path = validate_path(path.trim())?;
        if path.trim_end_matches('/').is_empty() {
            return Err(FileError::InvalidPath(path.to_string()));
        }

        self.executor.run(runtime_id, &["rm", "-rf", path]).await?;
        info!(runtime_id = %runtime_id, path = %path, "Path deleted");
        Ok(())
    }

    /// Download `url` into `destination_dir`, returning the stored file name
    pub async fn download_url(
        &self,
        runtime_id: &str,
        url: &str,
        destination_dir: &str,
    ) -> Result<String> {
        let destination_dir = validate_path(destination_dir)?;
        let parsed = url::Url::parse(url).map_err(|e| FileError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FileError::InvalidUrl(format!("unsupported scheme {}", parsed.scheme())));
        }

        let name = download_name(&parsed);
        let destination = join_path(destination_dir, &name);
        self.create_directory(runtime_id, destination_dir).await?;

        let curl = self
            .executor
            .run(runtime_id, &["curl", "-fsSL", "-o", destination.as_str(), url])
            .await;
        if let Err(curl_err) = curl {
            if !matches!(curl_err, ExecError::CommandFailed { .. }) {
                return Err(curl_err.into());
            }
            warn!(
                runtime_id = %runtime_id,
                url = %url,
                error = %curl_err,
                "curl download failed, trying wget"
            );

            let wget = self
                .executor
                .exec(
                    runtime_id,
                    &["wget", "-q", "-O", destination.as_str(), url],
                    ExecOptions::lenient(),
                )
                .await?;
            if !wget.success() {
                return Err(FileError::DownloadFailed {
                    url: url.to_string(),
                    message: wget.stderr.trim().to_string(),
                });
            }
        }

        info!(runtime_id = %runtime_id, url = %url, path = %destination, "URL downloaded");
        Ok(name)
    }

    /// Copy a regular file out of the instance
    pub async fn fetch_file(&self, runtime_id: &str, path: &str) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let probe = self
            .executor
            .exec(runtime_id, &["test", "-f", path], ExecOptions::lenient())
            .await?;
        if !probe.success() {
            return Err(FileError::NotFound(path.to_string()));
        }

        Ok(self.executor.runtime().copy_out(runtime_id, path).await?)
    }
}
