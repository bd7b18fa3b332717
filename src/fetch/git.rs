//! Clone and update repositories with the git CLI.
//!
//! git writes its progress meter to stderr with `\r` between updates; the
//! stream is split on both `\r` and `\n` and every recognised meter line is
//! forwarded to the progress sink.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::process::Stdio;

use super::progress::ProgressSink;
use crate::process::{ignore_interrupts, wait_child, was_interrupted, Cmd, ExecContext, Interrupted};

/// Non-progress stderr lines kept for the error message.
const TAIL_LINES: usize = 8;

/// One parsed progress meter line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitProgress {
    pub phase: String,
    pub current: u64,
    pub total: Option<u64>,
}

/// Parse a meter line such as `Receiving objects:  45% (450/1000), 1.2 MiB`
/// or `remote: Counting objects: 5, done.`.
pub fn parse_progress_line(line: &str) -> Option<GitProgress> {
    let line = line.trim();
    let line = line.strip_prefix("remote:").map_or(line, str::trim_start);
    let (phase, rest) = line.split_once(':')?;
    let phase = phase.trim();
    let rest = rest.trim();

    if let Some(open) = rest.find('(') {
        let close = open + rest[open..].find(')')?;
        let (current, total) = rest[open + 1..close].split_once('/')?;
        return Some(GitProgress {
            phase: phase.to_string(),
            current: current.trim().parse().ok()?,
            total: Some(total.trim().parse().ok()?),
        });
    }

    let count = rest.split(|c: char| !c.is_ascii_digit()).next()?;
    Some(GitProgress {
        phase: phase.to_string(),
        current: count.parse().ok()?,
        total: None,
    })
}

/// Shallow, single-branch clone of `branch` into `dest`.
pub fn clone(
    exec: &ExecContext,
    url: &str,
    dest: &Path,
    branch: &str,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    let cmd = git(exec)
        .args(["clone", "--progress", "--depth", "1", "--single-branch", "--branch"])
        .arg(branch)
        .arg(url)
        .arg(dest)
        .error_msg(format!("git clone of {url} (branch {branch}) failed"));
    run_with_progress(&cmd, sink)
}

/// Fast-forward the work tree at `dest` from `origin`.
pub fn pull(exec: &ExecContext, dest: &Path, sink: &mut dyn ProgressSink) -> Result<()> {
    if !dest.join(".git").exists() {
        bail!(
            "{} exists but is not a git work tree; move it away or remove it",
            dest.display()
        );
    }
    let cmd = git(exec)
        .arg("-C")
        .arg(dest)
        .args(["pull", "--progress", "--ff-only", "origin"])
        .error_msg(format!("git pull in {} failed", dest.display()));
    run_with_progress(&cmd, sink)
}

fn git(exec: &ExecContext) -> Cmd {
    Cmd::new("git")
        .env("GIT_TERMINAL_PROMPT", "0")
        .exec_context(exec)
}

fn run_with_progress(cmd: &Cmd, sink: &mut dyn ProgressSink) -> Result<()> {
    log::debug!("Running: {}", cmd.display());
    let mut child = cmd
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute {}", cmd.display()))?;

    let _guard = ignore_interrupts();
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let read = match child.stderr.take() {
        Some(stderr) => forward_progress(stderr, sink, &mut tail),
        None => Ok(()),
    };
    sink.finish();
    let status = wait_child(&mut child, cmd)?;
    read.context("reading git output")?;

    if was_interrupted(&status) {
        return Err(Interrupted.into());
    }
    if !status.success() {
        let detail = Vec::from(tail).join("\n  ");
        bail!("{} ({})\n  {}", cmd.failure_head(), status, detail);
    }
    Ok(())
}

fn forward_progress(
    mut stderr: impl Read,
    sink: &mut dyn ProgressSink,
    tail: &mut VecDeque<String>,
) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let mut line = Vec::new();
    loop {
        let n = match stderr.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        for &byte in &buf[..n] {
            if byte == b'\r' || byte == b'\n' {
                handle_line(&line, sink, tail);
                line.clear();
            } else {
                line.push(byte);
            }
        }
    }
    handle_line(&line, sink, tail);
    Ok(())
}

fn handle_line(raw: &[u8], sink: &mut dyn ProgressSink, tail: &mut VecDeque<String>) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if let Some(progress) = parse_progress_line(text) {
        sink.objects(&progress.phase, progress.current, progress.total);
        return;
    }
    log::debug!("git: {text}");
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(text.to_string());
}
