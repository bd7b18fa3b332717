//! Persisted build configuration.
//!
//! The configuration is a TOML file with three tables: `KERNEL` (kernel
//! source), `CLANG` (toolchain and make variables) and `ANYKERNEL3`
//! (packaging template). When the file does not exist it is written with the
//! defaults in [`DEFAULTS`] before the first read. A human edits the file
//! between runs; nothing in this crate writes to it afterwards.
//!
//! ```toml
//! [KERNEL]
//! kernel_name = "super"
//! kernel_branch = "main"
//!
//! [CLANG]
//! ARCH = "arm64"
//! LTO = 1            # scalars are read back as strings
//! ```

pub mod settings;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use settings::{KernelSettings, Settings, TemplateSettings, ToolchainSettings};

/// Default configuration file name, relative to the base directory.
pub const DEFAULT_CONFIG_FILENAME: &str = "config.toml";

pub const KERNEL_SECTION: &str = "KERNEL";
pub const TOOLCHAIN_SECTION: &str = "CLANG";
pub const TEMPLATE_SECTION: &str = "ANYKERNEL3";

/// Sections and keys written to a fresh configuration file, in file order.
pub const DEFAULTS: &[(&str, &[(&str, &str)])] = &[
    (
        KERNEL_SECTION,
        &[
            ("kernel_name", "super"),
            (
                "kernel_url",
                "https://github.com/sanjeevstunner/android_kernel_xiaomi_vayu.git",
            ),
            ("kernel_branch", "main"),
            ("kernel_config", "vayu_defconfig"),
            ("kernel_build_dir", "build"),
        ],
    ),
    (
        TOOLCHAIN_SECTION,
        &[
            (
                "clang_url",
                "https://android.googlesource.com/platform/prebuilts/clang/host/linux-x86/+archive/fb69815b96ce8dd4821078dd36ac92dde80a23e1/clang-r383902.tar.gz",
            ),
            ("clang_name", "aosp_clang"),
            ("ARCH", "arm64"),
            ("SUBARCH", ""),
            ("CC", "clang"),
            ("CC_CCACHE", "ccache clang"),
            ("CLANG_TRIPLE", "aarch64-linux-gnu-"),
            ("CROSS_COMPILE", "aarch64-linux-gnu-"),
            ("CROSS_COMPILE_ARM32", "arm-linux-gnueabi-"),
            ("LLVM", "1"),
            ("LLVM_IAS", "1"),
            ("LTO", "1"),
            ("extra_options", ""),
        ],
    ),
    (
        TEMPLATE_SECTION,
        &[
            ("anykernel3_url", "https://github.com/osm0sis/AnyKernel3.git"),
            ("anykernel3_branch", "master"),
            ("anykernel3_folder", "anykernel3"),
        ],
    ),
];

/// A scalar as it may appear in a hand-edited file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum ConfigValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl ConfigValue {
    fn into_string(self) -> String {
        match self {
            ConfigValue::Text(s) => s,
            ConfigValue::Integer(n) => n.to_string(),
            ConfigValue::Boolean(b) => b.to_string(),
        }
    }
}

/// Read-only view of the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigStore {
    /// Open the configuration at `path`, writing the defaults first when the
    /// file does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            write_default_config(path)?;
            log::info!("Wrote default configuration to {}", path.display());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading configuration '{}'", path.display()))?;
        Self::parse(path, &raw)
    }

    /// Parse configuration text. `path` is only used in messages.
    pub fn parse(path: &Path, raw: &str) -> Result<Self> {
        let parsed: BTreeMap<String, BTreeMap<String, ConfigValue>> = toml::from_str(raw)
            .with_context(|| format!("parsing configuration '{}'", path.display()))?;

        let sections = parsed
            .into_iter()
            .map(|(name, table)| {
                let table = table
                    .into_iter()
                    .map(|(key, value)| (key, value.into_string()))
                    .collect();
                (name, table)
            })
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            sections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up `key` in `section`.
    ///
    /// A missing section is an error; a missing key is `Ok(None)`, which
    /// callers treat as "feature disabled".
    pub fn load(&self, section: &str, key: &str) -> Result<Option<&str>> {
        let table = self.sections.get(section).ok_or_else(|| {
            anyhow!(
                "configuration '{}' has no [{}] section",
                self.path.display(),
                section
            )
        })?;
        Ok(table.get(key).map(String::as_str))
    }

    /// Like [`load`](Self::load), but a missing key is an error too.
    pub fn require(&self, section: &str, key: &str) -> Result<&str> {
        self.load(section, key)?.ok_or_else(|| {
            anyhow!(
                "configuration '{}' is missing required key '{}' in [{}]",
                self.path.display(),
                key,
                section
            )
        })
    }
}

/// Render [`DEFAULTS`] as TOML.
pub fn render_default_config() -> String {
    let mut out = String::from(
        "# kernel-builder configuration.\n\
         # Empty CLANG values leave the matching make variable unset.\n",
    );
    for (section, keys) in DEFAULTS {
        out.push_str(&format!("\n[{section}]\n"));
        for (key, value) in *keys {
            let quoted = toml::Value::String((*value).to_string());
            out.push_str(&format!("{key} = {quoted}\n"));
        }
    }
    out
}

/// Write the default configuration to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }
    }
    fs::write(path, render_default_config())
        .with_context(|| format!("writing default configuration '{}'", path.display()))
}
