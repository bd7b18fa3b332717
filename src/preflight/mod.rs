//! Preflight checks for build validation.
//!
//! Validates that the host has the tools the pipeline shells out to before
//! any directory is created or any byte is downloaded.
//!
//! # Example
//!
//! ```rust
//! use kernel_builder::preflight::{check_required_tools, command_exists};
//! use kernel_builder::ExecContext;
//!
//! let exec = ExecContext::inherit();
//! if !command_exists(&exec, "ccache") {
//!     println!("building without ccache");
//! }
//!
//! if let Err(e) = check_required_tools(&exec, &[("make", "make")]) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::process::ExecContext;

/// Check if a command exists on the context's search path.
pub fn command_exists(exec: &ExecContext, cmd: &str) -> bool {
    exec.which(cmd).is_some()
}

/// Host tools the full pipeline needs.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("make", "make"), ("git", "git")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(exec: &ExecContext, tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(exec, tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}
