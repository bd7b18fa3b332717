//! Host detection.
//!
//! Only one decision depends on it: under WSL the inherited `PATH` is the
//! Windows host's, so the search path is seeded from a fixed POSIX list
//! instead.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;

/// Search path used on WSL, where the inherited one is not usable.
pub const WSL_SEARCH_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin";

/// Operating system family of the build host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    Wsl1,
    Wsl2,
    Cygwin,
    Termux,
    Windows,
    MacOs,
    Unknown,
}

impl OsFamily {
    pub fn is_wsl(self) -> bool {
        matches!(self, OsFamily::Wsl1 | OsFamily::Wsl2)
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OsFamily::Linux => "Linux",
            OsFamily::Wsl1 => "WSL 1",
            OsFamily::Wsl2 => "WSL 2",
            OsFamily::Cygwin => "Cygwin",
            OsFamily::Termux => "Termux",
            OsFamily::Windows => "Windows",
            OsFamily::MacOs => "macOS",
            OsFamily::Unknown => "Unknown system",
        })
    }
}

/// What the probe found out about the build host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub architecture: String,
    pub os_family: OsFamily,
    /// Verbose platform string, e.g. `Linux-5.15.90.1-microsoft-standard-WSL2-x86_64`.
    pub platform: String,
}

impl HostInfo {
    pub fn detect() -> Self {
        let uts = Uname::current();
        let mut platform = format!("{}-{}-{}", uts.sysname, uts.release, uts.machine);
        if running_on_android() {
            platform.push_str("-with-Android");
        }
        let proc_version = fs::read_to_string("/proc/version").ok();

        Self {
            architecture: architecture(&uts.machine),
            os_family: classify(&uts.sysname, &platform, proc_version.as_deref()),
            platform,
        }
    }

    /// Initial search path for child processes.
    pub fn search_path_seed(&self, inherited: Option<&OsStr>) -> OsString {
        if self.os_family.is_wsl() {
            OsString::from(WSL_SEARCH_PATH)
        } else {
            inherited.map(OsStr::to_os_string).unwrap_or_default()
        }
    }
}

/// `x86_64` is reported as `Amd64`; every other machine name as-is.
pub fn architecture(machine: &str) -> String {
    if machine == "x86_64" {
        "Amd64".to_string()
    } else {
        machine.to_string()
    }
}

/// Classify the host from the kernel name (`uname -s`), the verbose platform
/// string and the contents of `/proc/version`, if readable.
pub fn classify(system: &str, platform: &str, proc_version: Option<&str>) -> OsFamily {
    match system {
        "Linux" => {
            if platform.to_lowercase().contains("microsoft") {
                wsl_version(proc_version).unwrap_or(OsFamily::Linux)
            } else if platform.contains("CYGWIN") {
                OsFamily::Cygwin
            } else if platform.contains("Android") {
                OsFamily::Termux
            } else {
                OsFamily::Linux
            }
        }
        "Windows" => OsFamily::Windows,
        "Darwin" => OsFamily::MacOs,
        _ => OsFamily::Unknown,
    }
}

fn wsl_version(proc_version: Option<&str>) -> Option<OsFamily> {
    let version = proc_version?.to_lowercase();
    if !version.contains("microsoft") {
        return None;
    }
    Some(if version.contains("wsl2") {
        OsFamily::Wsl2
    } else {
        OsFamily::Wsl1
    })
}

fn running_on_android() -> bool {
    cfg!(target_os = "android") || std::env::var_os("TERMUX_VERSION").is_some()
}

struct Uname {
    sysname: String,
    release: String,
    machine: String,
}

impl Uname {
    fn current() -> Self {
        // SAFETY: utsname is plain old data; zeroed is a valid value.
        let mut raw: libc::utsname = unsafe { std::mem::zeroed() };
        // SAFETY: `raw` is a valid, writable utsname for uname(2) to fill.
        if unsafe { libc::uname(&mut raw) } != 0 {
            return Self {
                sysname: fallback_sysname().to_string(),
                release: String::new(),
                machine: std::env::consts::ARCH.to_string(),
            };
        }
        Self {
            sysname: c_field(&raw.sysname),
            release: c_field(&raw.release),
            machine: c_field(&raw.machine),
        }
    }
}

fn fallback_sysname() -> &'static str {
    match std::env::consts::OS {
        "linux" | "android" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    }
}

fn c_field(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
