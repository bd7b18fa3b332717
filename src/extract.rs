//! Archive extraction with explicit conflict handling.
//!
//! Extracting into a non-empty directory is never silent: a
//! [`ConflictResolver`] decides whether the existing contents are wiped,
//! kept, or whether the run stops.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, IsTerminal, Read, Write};
use std::path::Path;
use std::str::FromStr;

/// Answer to "the destination is not empty".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Delete everything in the destination, then extract.
    Overwrite,
    /// Leave the destination as it is and carry on.
    Skip,
    /// Stop with an error.
    Abort,
}

pub trait ConflictResolver {
    fn resolve(&mut self, destination: &Path) -> Result<Resolution>;
}

/// A fixed answer.
impl ConflictResolver for Resolution {
    fn resolve(&mut self, _destination: &Path) -> Result<Resolution> {
        Ok(*self)
    }
}

/// How to resolve conflicts for a whole run, as chosen on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    #[default]
    Abort,
    Overwrite,
    Skip,
    /// Ask on the terminal.
    Ask,
}

impl ConflictPolicy {
    /// Default policy: ask when someone can answer, abort otherwise.
    pub fn for_terminal(interactive: bool) -> Self {
        if interactive {
            ConflictPolicy::Ask
        } else {
            ConflictPolicy::Abort
        }
    }

    pub fn detect() -> Self {
        Self::for_terminal(std::io::stdin().is_terminal())
    }

    pub fn resolver(self) -> Box<dyn ConflictResolver> {
        match self {
            ConflictPolicy::Abort => Box::new(Resolution::Abort),
            ConflictPolicy::Overwrite => Box::new(Resolution::Overwrite),
            ConflictPolicy::Skip => Box::new(Resolution::Skip),
            ConflictPolicy::Ask => Box::new(Prompt::stdio()),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(ConflictPolicy::Abort),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "skip" => Ok(ConflictPolicy::Skip),
            "ask" => Ok(ConflictPolicy::Ask),
            other => Err(format!(
                "unknown conflict policy '{other}' (expected abort, overwrite, skip or ask)"
            )),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictPolicy::Abort => "abort",
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::Skip => "skip",
            ConflictPolicy::Ask => "ask",
        })
    }
}

/// Yes/no question on a line-based stream. `y` or `yes` overwrites;
/// anything else, including end of input, skips.
pub struct Prompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl Prompt<BufReader<std::io::Stdin>, std::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> ConflictResolver for Prompt<R, W> {
    fn resolve(&mut self, destination: &Path) -> Result<Resolution> {
        write!(
            self.output,
            "{} is not empty. Do you want to overwrite existing files? (y/n): ",
            destination.display()
        )?;
        self.output.flush()?;

        let mut answer = String::new();
        self.input
            .read_line(&mut answer)
            .context("reading answer from stdin")?;
        Ok(match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Resolution::Overwrite,
            _ => Resolution::Skip,
        })
    }
}

/// Compression of a tar archive, from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarZst,
    Tar,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Ok(ArchiveFormat::TarZst)
        } else if name.ends_with(".tar") {
            Ok(ArchiveFormat::Tar)
        } else {
            bail!("unsupported archive format: {}", path.display())
        }
    }

    /// File name suffix, including the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::TarZst => ".tar.zst",
            ArchiveFormat::Tar => ".tar",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Extracted { entries: usize },
    /// The destination was not empty and the resolver chose to keep it.
    Skipped,
}

/// Extract `archive` into `destination`.
pub fn extract_archive(
    archive: &Path,
    destination: &Path,
    resolver: &mut dyn ConflictResolver,
) -> Result<ExtractOutcome> {
    if !archive.is_file() {
        bail!("File does not exist: {}", archive.display());
    }
    let format = ArchiveFormat::from_path(archive)?;

    fs::create_dir_all(destination)
        .with_context(|| format!("Failed to create {}", destination.display()))?;

    if !is_empty_dir(destination)? {
        match resolver.resolve(destination)? {
            Resolution::Overwrite => {
                log::info!("Removing existing contents of {}", destination.display());
                clear_dir(destination)?;
            }
            Resolution::Skip => {
                log::info!("Extraction cancelled.");
                return Ok(ExtractOutcome::Skipped);
            }
            Resolution::Abort => bail!(
                "{} is not empty; pass --on-conflict overwrite or skip to proceed",
                destination.display()
            ),
        }
    }

    let f = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(BufReader::new(f))),
        ArchiveFormat::TarZst => Box::new(zstd::stream::Decoder::new(f)?),
        ArchiveFormat::Tar => Box::new(BufReader::new(f)),
    };

    let entries = unpack(reader, destination)
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    log::info!(
        "Finished extracting {} to {}.",
        archive.display(),
        destination.display()
    );
    Ok(ExtractOutcome::Extracted { entries })
}

/// Unpack every member under `destination`. Directory entries are applied
/// last, deepest first, so a read-only directory does not block its own
/// children.
fn unpack(reader: impl Read, destination: &Path) -> Result<usize> {
    let mut archive = tar::Archive::new(reader);
    let mut directories = Vec::new();
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() == tar::EntryType::Directory {
            directories.push(entry);
        } else if entry.unpack_in(destination)? {
            count += 1;
        } else {
            skipped(&entry)?;
        }
    }

    directories.sort_by(|a, b| b.path_bytes().cmp(&a.path_bytes()));
    for mut dir in directories {
        if dir.unpack_in(destination)? {
            count += 1;
        } else {
            skipped(&dir)?;
        }
    }
    Ok(count)
}

fn skipped<R: Read>(entry: &tar::Entry<'_, R>) -> Result<()> {
    log::warn!(
        "Skipped archive member outside the destination: {}",
        entry.path()?.display()
    );
    Ok(())
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    Ok(entries.next().is_none())
}

fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}
