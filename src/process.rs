//! Child process plumbing.
//!
//! [`Cmd`] is a small builder over [`std::process::Command`] that attaches a
//! human-readable error message to failures. Children never see the ambient
//! `PATH`: every invocation carries the search path of an [`ExecContext`],
//! which is how the fetched toolchain reaches `make` without touching the
//! orchestrator's own environment.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};

/// Search path handed to every child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecContext {
    search_path: OsString,
}

impl ExecContext {
    pub fn new(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: search_path.into(),
        }
    }

    /// Context seeded from the inherited `PATH`.
    pub fn inherit() -> Self {
        Self::new(std::env::var_os("PATH").unwrap_or_default())
    }

    pub fn search_path(&self) -> &OsStr {
        &self.search_path
    }

    /// Return a copy of this context with `dir` searched first.
    pub fn with_prepended_path(&self, dir: &Path) -> Result<Self> {
        let mut dirs = vec![dir.to_path_buf()];
        dirs.extend(
            std::env::split_paths(&self.search_path).filter(|p| !p.as_os_str().is_empty()),
        );
        let search_path = std::env::join_paths(dirs)
            .with_context(|| format!("adding '{}' to the search path", dir.display()))?;
        Ok(Self { search_path })
    }

    /// Locate `program` on this context's search path.
    pub fn which(&self, program: &str) -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok()?;
        which::which_in(program, Some(&self.search_path), cwd).ok()
    }
}

/// The operator interrupted a running child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted by user")
    }
}

impl std::error::Error for Interrupted {}

/// Builder for a single child process invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    dir: Option<PathBuf>,
    exec: Option<ExecContext>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            dir: None,
            exec: None,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Run the child with the search path of `exec`.
    pub fn exec_context(mut self, exec: &ExecContext) -> Self {
        self.exec = Some(exec.clone());
        self
    }

    /// Message used as the head of the error when the child fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Shell-like rendering of the command line, for logs.
    pub fn display(&self) -> String {
        let mut tokens = vec![self.program.to_string_lossy().into_owned()];
        tokens.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        display_command(&tokens)
    }

    /// Materialize the underlying [`Command`].
    ///
    /// A bare program name is resolved against the context's search path, so
    /// a toolchain prepended there wins over the host's copy.
    pub fn to_command(&self) -> Command {
        let program = match &self.exec {
            Some(exec) if !self.program.to_string_lossy().contains('/') => exec
                .which(&self.program.to_string_lossy())
                .map(PathBuf::into_os_string)
                .unwrap_or_else(|| self.program.clone()),
            _ => self.program.clone(),
        };

        let mut command = Command::new(program);
        command.args(&self.args);
        if let Some(exec) = &self.exec {
            command.env("PATH", exec.search_path());
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        // SAFETY: signal(2) is async-signal-safe, so it may run between fork
        // and exec. The child must not inherit an ignored SIGINT.
        unsafe {
            command.pre_exec(|| {
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                Ok(())
            });
        }
        command
    }

    /// Run the command, capturing its output. Non-zero exit is an error that
    /// carries the child's stderr.
    pub fn run(&self) -> Result<Output> {
        let output = self
            .to_command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to execute {}", self.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{}\n  command: {}\n  exit: {}\n  stderr: {}",
                self.failure_head(),
                self.display(),
                output.status,
                stderr.trim()
            );
        }

        Ok(output)
    }

    /// Run the command with the terminal attached, so its output streams
    /// live. An interrupt delivered to the child surfaces as [`Interrupted`].
    pub fn run_interactive(&self) -> Result<()> {
        let mut child = self
            .to_command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to execute {}", self.display()))?;

        let _guard = ignore_interrupts();
        let status = wait_child(&mut child, self)?;
        self.check_status(status)
    }

    /// Turn a finished child's status into a result.
    pub fn check_status(&self, status: ExitStatus) -> Result<()> {
        if was_interrupted(&status) {
            return Err(Interrupted.into());
        }
        if !status.success() {
            bail!("{} ({})", self.failure_head(), status);
        }
        Ok(())
    }

    pub(crate) fn failure_head(&self) -> String {
        self.error_msg
            .clone()
            .unwrap_or_else(|| format!("command failed: {}", self.display()))
    }
}

pub(crate) fn wait_child(child: &mut Child, cmd: &Cmd) -> Result<ExitStatus> {
    child
        .wait()
        .with_context(|| format!("waiting for {}", cmd.display()))
}

/// Render tokens the way a user would type them into a shell.
pub fn display_command<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| quote(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(token: &str) -> String {
    let plain = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=./:,+@%".contains(c));
    if plain {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

/// While alive, SIGINT is ignored by this process. Children reset it to the
/// default disposition before exec, so Ctrl-C stops the child and the
/// orchestrator observes it through the exit status.
pub(crate) struct InterruptGuard {
    previous: Option<libc::sighandler_t>,
}

pub(crate) fn ignore_interrupts() -> InterruptGuard {
    // SAFETY: installing SIG_IGN for SIGINT has no memory-safety requirements;
    // the previous disposition is restored when the guard drops.
    let previous = unsafe { libc::signal(libc::SIGINT, libc::SIG_IGN) };
    InterruptGuard {
        previous: (previous != libc::SIG_ERR).then_some(previous),
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous {
            // SAFETY: `previous` was returned by signal(2) for SIGINT.
            unsafe {
                libc::signal(libc::SIGINT, previous);
            }
        }
    }
}

pub(crate) fn was_interrupted(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGINT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepended_dir_is_searched_first() {
        let ctx = ExecContext::new("/usr/bin:/bin");
        let ctx = ctx
            .with_prepended_path(Path::new("/opt/clang/bin"))
            .unwrap();
        assert_eq!(ctx.search_path(), "/opt/clang/bin:/usr/bin:/bin");
    }

    #[test]
    fn prepending_to_empty_path_leaves_no_trailing_separator() {
        let ctx = ExecContext::new("")
            .with_prepended_path(Path::new("/opt/clang/bin"))
            .unwrap();
        assert_eq!(ctx.search_path(), "/opt/clang/bin");
    }

    #[test]
    fn prepending_does_not_touch_the_process_environment() {
        let before = std::env::var_os("PATH");
        let _ = ExecContext::inherit()
            .with_prepended_path(Path::new("/nonexistent/toolchain/bin"))
            .unwrap();
        assert_eq!(std::env::var_os("PATH"), before);
    }

    #[test]
    fn child_sees_context_search_path() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = ExecContext::inherit()
            .with_prepended_path(temp.path())
            .unwrap();
        let output = Cmd::new("sh")
            .args(["-c", "printf %s \"$PATH\""])
            .exec_context(&ctx)
            .run()
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            ctx.search_path().to_string_lossy()
        );
    }

    #[test]
    fn failing_command_reports_error_msg() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .error_msg("probe failed")
            .run()
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("probe failed"), "{msg}");
        assert!(msg.contains("boom"), "{msg}");
    }

    #[test]
    fn interactive_failure_is_an_error() {
        let result = Cmd::new("false").error_msg("make failed").run_interactive();
        let err = result.unwrap_err();
        assert!(format!("{err}").contains("make failed"));
        assert!(err.downcast_ref::<Interrupted>().is_none());
    }

    #[test]
    fn child_killed_by_sigint_is_interrupted() {
        let err = Cmd::new("sh")
            .args(["-c", "kill -INT $$"])
            .run_interactive()
            .unwrap_err();
        assert!(err.downcast_ref::<Interrupted>().is_some());
    }

    #[test]
    fn display_quotes_tokens_with_spaces() {
        let rendered = display_command(&["make", "CC=ccache clang", "-j8"]);
        assert_eq!(rendered, "make 'CC=ccache clang' -j8");
    }
}
