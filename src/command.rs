//! Assembly of the kernel `make` command line.

use std::fmt;
use std::path::Path;

use crate::config::ToolchainSettings;
use crate::process::{display_command, Cmd};

pub const BUILD_TOOL: &str = "make";

/// Job count used when the host's parallelism cannot be queried.
const FALLBACK_JOBS: usize = 4;

/// An argument vector for one `make` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
    tokens: Vec<String>,
}

impl BuildCommand {
    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Copy of this command with a make target appended.
    pub fn with_target(&self, target: &str) -> Self {
        let mut tokens = self.tokens.clone();
        let target = target.trim();
        if !target.is_empty() {
            tokens.push(target.to_string());
        }
        Self { tokens }
    }

    pub fn to_cmd(&self) -> Cmd {
        Cmd::new(self.program()).args(self.args())
    }
}

impl fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&display_command(&self.tokens))
    }
}

/// Build the base `make` command for `toolchain`.
///
/// `ccache_available` selects `CC_CCACHE` over `CC`. Empty values and
/// toggles that are off contribute nothing.
pub fn assemble(
    toolchain: &ToolchainSettings,
    out_dir: &Path,
    jobs: usize,
    ccache_available: bool,
) -> BuildCommand {
    let mut tokens = vec![
        BUILD_TOOL.to_string(),
        format!("-j{jobs}"),
        format!("O={}", out_dir.display()),
    ];

    let cc = if ccache_available {
        &toolchain.cc_ccache
    } else {
        &toolchain.cc
    };
    let variables = [
        ("ARCH", &toolchain.arch),
        ("SUBARCH", &toolchain.subarch),
        ("CC", cc),
        ("CLANG_TRIPLE", &toolchain.clang_triple),
        ("CROSS_COMPILE", &toolchain.cross_compile),
        ("CROSS_COMPILE_ARM32", &toolchain.cross_compile_arm32),
    ];
    for (name, value) in variables {
        if !value.is_empty() {
            tokens.push(format!("{name}={value}"));
        }
    }

    for (name, on) in [
        ("LLVM", toolchain.llvm),
        ("LLVM_IAS", toolchain.llvm_ias),
        ("LTO", toolchain.lto),
    ] {
        if on {
            tokens.push(format!("{name}=1"));
        }
    }

    tokens.extend(toolchain.extra_options.split_whitespace().map(str::to_string));
    tokens.retain(|t| !t.is_empty());

    BuildCommand { tokens }
}

/// Logical CPU count of the host.
pub fn host_jobs() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            log::warn!("Could not query CPU count ({e}); using -j{FALLBACK_JOBS}");
            FALLBACK_JOBS
        }
    }
}

/// Both invocations of a build: configuration target first, then the
/// default target.
pub fn build_sequence(base: &BuildCommand, defconfig: &str) -> [BuildCommand; 2] {
    [base.with_target(defconfig), base.clone()]
}
