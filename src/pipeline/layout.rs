//! On-disk layout of a build, relative to the base directory.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::extract::ArchiveFormat;

pub const REQUIREMENTS_DIR: &str = "requirements";
pub const SOURCE_DIR: &str = "src";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub base_dir: PathBuf,
    /// Toolchain archive, extracted toolchain and packaging template.
    pub requirements_dir: PathBuf,
    pub source_dir: PathBuf,
    /// `O=` directory handed to make.
    pub build_dir: PathBuf,
    pub kernel_root: PathBuf,
    pub toolchain_archive: PathBuf,
    pub toolchain_dir: PathBuf,
    pub template_dir: PathBuf,
}

impl Layout {
    pub fn new(base_dir: &Path, settings: &Settings) -> Self {
        let requirements_dir = base_dir.join(REQUIREMENTS_DIR);
        let source_dir = base_dir.join(SOURCE_DIR);
        let archive_name =
            toolchain_archive_name(&settings.toolchain.name, &settings.toolchain.url);
        Self {
            base_dir: base_dir.to_path_buf(),
            build_dir: resolve_base_path(base_dir, &settings.kernel.build_dir),
            kernel_root: source_dir.join(&settings.kernel.name),
            toolchain_archive: requirements_dir.join(archive_name),
            toolchain_dir: requirements_dir.join(&settings.toolchain.name),
            template_dir: requirements_dir.join(&settings.template.folder),
            requirements_dir,
            source_dir,
        }
    }

    /// Create the top-level directories that do not exist yet.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.requirements_dir, &self.build_dir, &self.source_dir] {
            if !dir.exists() {
                log::info!("Creating folder {}", dir.display());
            }
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory '{}'", dir.display()))?;
        }
        Ok(())
    }
}

pub(crate) fn resolve_base_path(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

/// Archive file name for the toolchain: `name` plus the archive extension
/// of the URL's last path segment, `.tar.gz` when it has none.
pub fn toolchain_archive_name(name: &str, url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
    let ext = ArchiveFormat::from_path(Path::new(last))
        .map(ArchiveFormat::extension)
        .unwrap_or(ArchiveFormat::TarGz.extension());
    format!("{name}{ext}")
}

/// Directory with the toolchain binaries: `<dir>/bin`, or the `bin` of the
/// single directory an archive wrapped its contents in.
pub fn locate_toolchain_bin(dir: &Path) -> PathBuf {
    let direct = dir.join("bin");
    if direct.is_dir() {
        return direct;
    }

    let subdirs: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    if let [only] = subdirs.as_slice() {
        let nested = only.join("bin");
        if nested.is_dir() {
            return nested;
        }
    }

    log::warn!(
        "No bin directory found in {}; exporting {} anyway",
        dir.display(),
        direct.display()
    );
    direct
}
