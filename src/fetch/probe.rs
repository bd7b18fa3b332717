//! Decide whether a source URL names a git repository or a plain file.
//!
//! Remote sources are probed through git's smart HTTP discovery endpoint.
//! The answer is a heuristic: a server that hides `info/refs` behind a
//! redirect or an auth wall is reported as a flat file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;

/// Timeout for the discovery request.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Repository,
    FlatFile,
    /// The probe itself failed. Callers treat this like [`SourceKind::FlatFile`].
    Undetermined,
}

/// Smart HTTP ref discovery URL for a repository URL.
pub fn info_refs_url(url: &str) -> String {
    format!("{}/info/refs?service=git-upload-pack", url.trim_end_matches('/'))
}

/// Classify `url`.
pub fn probe_source(client: &Client, url: &str) -> SourceKind {
    if let Some(path) = local_path(url) {
        return probe_local(&path);
    }
    if is_git_only(url) {
        return SourceKind::Repository;
    }

    let probe = info_refs_url(url);
    log::debug!("Probing {probe}");
    match client.get(&probe).timeout(PROBE_TIMEOUT).send() {
        Ok(response) if response.status() == StatusCode::OK => SourceKind::Repository,
        Ok(response) => {
            log::debug!("{probe} answered {}", response.status());
            SourceKind::FlatFile
        }
        Err(e) => {
            log::debug!("probe of {probe} failed: {e}");
            SourceKind::Undetermined
        }
    }
}

/// Filesystem path named by `url`, for `file://` URLs and bare paths.
pub fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if url.contains("://") || is_scp_like(url) {
        return None;
    }
    Some(PathBuf::from(url))
}

fn probe_local(path: &Path) -> SourceKind {
    let work_tree = path.join(".git").exists();
    let bare = path.join("HEAD").is_file() && path.join("objects").is_dir();
    if work_tree || bare {
        SourceKind::Repository
    } else if path.is_file() {
        SourceKind::FlatFile
    } else {
        SourceKind::Undetermined
    }
}

/// Schemes only git can fetch from.
fn is_git_only(url: &str) -> bool {
    is_scp_like(url)
        || ["ssh://", "git://", "git+ssh://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
}

/// `user@host:path/repo.git`
fn is_scp_like(url: &str) -> bool {
    match url.split_once(':') {
        Some((host, _)) => !host.is_empty() && !host.contains('/') && host.contains('@'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::fs;
    use tempfile::TempDir;

    fn client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    #[test]
    fn info_refs_strips_trailing_slash() {
        assert_eq!(
            info_refs_url("https://github.com/osm0sis/AnyKernel3.git/"),
            "https://github.com/osm0sis/AnyKernel3.git/info/refs?service=git-upload-pack"
        );
    }

    #[test]
    fn local_paths() {
        assert_eq!(local_path("file:///srv/k.git"), Some(PathBuf::from("/srv/k.git")));
        assert_eq!(local_path("/srv/clang.tar.gz"), Some(PathBuf::from("/srv/clang.tar.gz")));
        assert_eq!(local_path("https://example.com/a.tar.gz"), None);
        assert_eq!(local_path("git@github.com:osm0sis/AnyKernel3.git"), None);
    }

    #[test]
    fn ssh_sources_are_repositories() {
        let c = client();
        assert_eq!(probe_source(&c, "git@github.com:a/b.git"), SourceKind::Repository);
        assert_eq!(probe_source(&c, "ssh://git@host/a/b.git"), SourceKind::Repository);
    }

    #[test]
    fn local_sources() {
        let temp = TempDir::new().unwrap();
        let repo = testutil::init_repo(&temp.path().join("repo"), "main");
        let file = temp.path().join("clang.tar.gz");
        fs::write(&file, b"archive").unwrap();

        let c = client();
        assert_eq!(probe_source(&c, repo.to_str().unwrap()), SourceKind::Repository);
        assert_eq!(
            probe_source(&c, &format!("file://{}", repo.display())),
            SourceKind::Repository
        );
        assert_eq!(probe_source(&c, file.to_str().unwrap()), SourceKind::FlatFile);
        assert_eq!(
            probe_source(&c, temp.path().join("missing").to_str().unwrap()),
            SourceKind::Undetermined
        );
    }

    #[test]
    fn bare_repository_is_detected() {
        let temp = TempDir::new().unwrap();
        let bare = temp.path().join("bare.git");
        fs::create_dir_all(bare.join("objects")).unwrap();
        fs::write(bare.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        assert_eq!(probe_local(&bare), SourceKind::Repository);
    }

    #[test]
    fn http_status_decides() {
        let advertisement = b"001e# service=git-upload-pack\n";
        let (url, server) =
            testutil::serve_once(testutil::http_response("200 OK", &[], advertisement));
        assert_eq!(probe_source(&client(), &url), SourceKind::Repository);
        let request = server.join().unwrap();
        assert!(request.contains("/info/refs?service=git-upload-pack"), "{request}");

        let (url, server) =
            testutil::serve_once(testutil::http_response("404 Not Found", &[], b""));
        assert_eq!(probe_source(&client(), &url), SourceKind::FlatFile);
        server.join().unwrap();
    }

    #[test]
    fn unreachable_host_is_undetermined() {
        let url = testutil::unused_local_url();
        assert_eq!(probe_source(&client(), &url), SourceKind::Undetermined);
    }
}
