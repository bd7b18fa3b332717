//! Flat file transfers.
//!
//! Bodies are written to `<dest>.part` and renamed once complete, so a file
//! under its final name is always a whole one. A `<dest>.part.toml` beside
//! the staging file records the URL and validator it was started from; a
//! `.part` file without a matching record is never resumed.

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use super::progress::{human_bytes, ProgressSink, TransferStats};

/// Read size for streamed bodies.
pub const CHUNK_SIZE: usize = 4096;

/// Staging path for a transfer into `dest`.
pub fn part_path(dest: &Path) -> PathBuf {
    with_suffix(dest, ".part")
}

/// Resume record for the staging file of `dest`.
pub fn state_path(dest: &Path) -> PathBuf {
    with_suffix(dest, ".part.toml")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Where a `.part` file came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartState {
    pub url: String,
    /// Strong `ETag` or `Last-Modified` of the response that started it.
    pub validator: Option<String>,
}

impl PartState {
    /// Read the record for `dest`. Missing or unreadable records yield `None`.
    pub fn load(dest: &Path) -> Option<Self> {
        let text = fs::read_to_string(state_path(dest)).ok()?;
        toml::from_str(&text).ok()
    }

    pub fn save(&self, dest: &Path) -> Result<()> {
        let path = state_path(dest);
        let text = toml::to_string(self).context("serializing resume state")?;
        fs::write(&path, text).with_context(|| format!("writing {}", path.display()))
    }
}

enum Attempt {
    Done(u64),
    /// The staging file cannot be continued; start again from zero.
    Restart,
}

/// Download `url` to `dest`, resuming a leftover `.part` file when the
/// server supports ranges. Returns the final size in bytes.
///
/// A resume that the server rejects (416) or answers from the wrong offset
/// discards the staging file and restarts once from zero.
pub fn download(
    client: &Client,
    url: &str,
    dest: &Path,
    sink: &mut dyn ProgressSink,
) -> Result<u64> {
    if let Attempt::Done(n) = attempt(client, url, dest, sink)? {
        return Ok(n);
    }
    discard_part(dest)?;
    match attempt(client, url, dest, sink)? {
        Attempt::Done(n) => Ok(n),
        Attempt::Restart => bail!("server refused a fresh download of {url}"),
    }
}

fn attempt(
    client: &Client,
    url: &str,
    dest: &Path,
    sink: &mut dyn ProgressSink,
) -> Result<Attempt> {
    let part = part_path(dest);
    let mut offset = fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
    let state = PartState::load(dest);
    if offset > 0 && state.as_ref().map(|s| s.url.as_str()) != Some(url) {
        log::warn!("{} was started from another source; starting over", part.display());
        discard_part(dest)?;
        offset = 0;
    }

    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
        if let Some(validator) = state.as_ref().and_then(|s| s.validator.as_deref()) {
            request = request.header(IF_RANGE, validator);
        }
    }
    let response = request
        .send()
        .with_context(|| format!("requesting {url}"))?;

    if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        log::warn!("Server cannot resume {}; starting over", part.display());
        return Ok(Attempt::Restart);
    }

    let response = response
        .error_for_status()
        .with_context(|| format!("downloading {url}"))?;

    let resumed = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    let (file, offset, total) = if resumed {
        let range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let total = match range {
            Some((start, total)) if start == offset => total,
            _ => {
                log::warn!(
                    "Server did not resume {} at byte {}; starting over",
                    dest.display(),
                    offset
                );
                return Ok(Attempt::Restart);
            }
        };
        log::info!("Resuming {} after {}", dest.display(), human_bytes(offset));
        let file = OpenOptions::new()
            .append(true)
            .open(&part)
            .with_context(|| format!("opening {}", part.display()))?;
        (file, offset, total)
    } else {
        let file = File::create(&part).with_context(|| format!("creating {}", part.display()))?;
        PartState {
            url: url.to_string(),
            validator: validator(response.headers()),
        }
        .save(dest)?;
        (file, 0, None)
    };

    let expected = total.or_else(|| response.content_length().map(|len| len + offset));
    let stats = TransferStats::new(offset, expected);
    let received = stream_to_file(response, file, stats, sink)
        .with_context(|| format!("downloading {url}"))?;
    finalize(&part, dest, received, expected)?;
    remove_if_exists(&state_path(dest))?;
    Ok(Attempt::Done(received))
}

/// `(first byte, complete length)` of a `Content-Range: bytes a-b/n` value.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (range, total) = value.trim().strip_prefix("bytes ")?.split_once('/')?;
    let (start, _) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    Some((start, total))
}

/// Validator usable in `If-Range`. Weak entity tags are not allowed there.
fn validator(headers: &HeaderMap) -> Option<String> {
    let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
    header(ETAG)
        .filter(|tag| !tag.starts_with("W/"))
        .or_else(|| header(LAST_MODIFIED))
        .map(str::to_string)
}

/// Remove the staging file of `dest` and its resume record.
pub fn discard_part(dest: &Path) -> Result<()> {
    remove_if_exists(&part_path(dest))?;
    remove_if_exists(&state_path(dest))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(e).with_context(|| format!("removing {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// Copy a local file to `dest` through the same staging as a download.
pub fn copy_local(src: &Path, dest: &Path, sink: &mut dyn ProgressSink) -> Result<u64> {
    let reader = File::open(src).with_context(|| format!("opening {}", src.display()))?;
    let expected = reader
        .metadata()
        .with_context(|| format!("reading metadata of {}", src.display()))?
        .len();

    let part = part_path(dest);
    let file = File::create(&part).with_context(|| format!("creating {}", part.display()))?;
    let received = stream_to_file(reader, file, TransferStats::new(0, Some(expected)), sink)
        .with_context(|| format!("copying {}", src.display()))?;
    finalize(&part, dest, received, Some(expected))?;
    Ok(received)
}

/// Append everything `reader` yields to `file` in [`CHUNK_SIZE`] reads.
/// Returns the total byte count including the resumed offset.
pub fn stream_to_file(
    reader: impl Read,
    file: File,
    stats: TransferStats,
    sink: &mut dyn ProgressSink,
) -> Result<u64> {
    let result = pump(reader, file, stats, sink);
    sink.finish();
    result
}

fn pump(
    mut reader: impl Read,
    mut file: File,
    mut stats: TransferStats,
    sink: &mut dyn ProgressSink,
) -> Result<u64> {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("reading body"),
        };
        file.write_all(&buf[..n]).context("writing body")?;
        stats.received += n as u64;
        sink.bytes(&stats);
    }
    file.flush()?;
    Ok(stats.received)
}

/// Move a finished `.part` file into place after checking its size.
///
/// A short file is kept for the next resume; an oversized one is removed.
pub fn finalize(part: &Path, dest: &Path, received: u64, expected: Option<u64>) -> Result<()> {
    if let Some(expected) = expected.filter(|&n| n != 0) {
        if received != expected {
            if received > expected {
                fs::remove_file(part).with_context(|| format!("removing {}", part.display()))?;
            }
            bail!(
                "size mismatch for {}: expected {} bytes, received {}",
                dest.display(),
                expected,
                received
            );
        }
    }
    fs::rename(part, dest)
        .with_context(|| format!("moving {} to {}", part.display(), dest.display()))
}
