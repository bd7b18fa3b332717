//! Fetching of sources: git repositories and flat files.
//!
//! A fetch never clobbers an existing destination. A repository that is
//! already present is fast-forwarded; a file that is already present is left
//! alone.

pub mod git;
pub mod http;
pub mod probe;
pub mod progress;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client, ClientBuilder};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::settings::DEFAULT_BRANCH;
use crate::process::ExecContext;
pub use probe::SourceKind;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a request may wait on the server, per read. A transfer as a whole
/// has no deadline.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client settings shared by probes and downloads.
pub fn client_builder(io_timeout: Duration) -> ClientBuilder {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(io_timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
}

/// What to fetch and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub url: String,
    pub destination: PathBuf,
    /// Only meaningful for repositories.
    pub branch: String,
}

impl SourceDescriptor {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            branch: DEFAULT_BRANCH.to_string(),
        }
    }

    /// Set the branch to clone. An empty name keeps the default.
    pub fn with_branch(mut self, branch: &str) -> Self {
        let branch = branch.trim();
        if !branch.is_empty() {
            self.branch = branch.to_string();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Cloned,
    Updated,
    Downloaded { bytes: u64 },
    /// The destination already existed and was left untouched.
    Skipped,
}

/// Something that can materialize a [`SourceDescriptor`] on disk.
pub trait SourceFetcher {
    fn fetch(&mut self, source: &SourceDescriptor) -> Result<FetchOutcome>;
}

/// Fetcher backed by the git CLI and a blocking HTTP client.
pub struct Fetcher {
    client: Client,
    exec: ExecContext,
    show_progress: bool,
}

impl Fetcher {
    pub fn new(exec: ExecContext) -> Result<Self> {
        let client = client_builder(IO_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self::with_client(client, exec))
    }

    pub fn with_client(client: Client, exec: ExecContext) -> Self {
        Self {
            client,
            exec,
            show_progress: true,
        }
    }

    /// Enable or disable the live progress display.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    pub fn probe(&self, url: &str) -> SourceKind {
        probe::probe_source(&self.client, url)
    }

    /// Fetch `source`, trusting `kind` instead of probing.
    pub fn fetch_as(&self, kind: SourceKind, source: &SourceDescriptor) -> Result<FetchOutcome> {
        let dest = &source.destination;
        let label = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.url.clone());
        let mut sink = progress::sink(&label, self.show_progress);

        match kind {
            SourceKind::Repository => {
                if dest.exists() {
                    log::info!("Updating git repository at [{}]", dest.display());
                    git::pull(&self.exec, dest, sink.as_mut())?;
                    Ok(FetchOutcome::Updated)
                } else {
                    log::info!(
                        "Cloning git repository from [{}] to [{}]",
                        source.url,
                        dest.display()
                    );
                    git::clone(&self.exec, &source.url, dest, &source.branch, sink.as_mut())?;
                    Ok(FetchOutcome::Cloned)
                }
            }
            SourceKind::FlatFile | SourceKind::Undetermined => {
                if dest.exists() {
                    log::warn!("{} already exists. Skipping download.", dest.display());
                    return Ok(FetchOutcome::Skipped);
                }
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let bytes = match probe::local_path(&source.url) {
                    Some(path) => http::copy_local(&path, dest, sink.as_mut())?,
                    None => http::download(&self.client, &source.url, dest, sink.as_mut())?,
                };
                log::info!("Downloaded file from {} to {}", source.url, dest.display());
                Ok(FetchOutcome::Downloaded { bytes })
            }
        }
    }
}

impl SourceFetcher for Fetcher {
    fn fetch(&mut self, source: &SourceDescriptor) -> Result<FetchOutcome> {
        let kind = self.probe(&source.url);
        match kind {
            SourceKind::Undetermined => log::warn!(
                "Could not tell whether {} is a git repository; fetching it as a file",
                source.url
            ),
            _ => log::debug!("{} probed as {:?}", source.url, kind),
        }
        self.fetch_as(kind, source).with_context(|| {
            format!(
                "Failed to fetch {} into {}",
                source.url,
                source.destination.display()
            )
        })
    }
}

/// Hex sha256 of the file at `path`.
pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check `path` against `expected` (lowercase hex). A mismatching file is
/// deleted so the next run downloads it again.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected.trim().to_ascii_lowercase() {
        fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
        bail!(
            "checksum mismatch for {}: expected {}, got {}; the file was removed",
            path.display(),
            expected,
            actual
        );
    }
    log::info!("Verified sha256 of {}", path.display());
    Ok(())
}
