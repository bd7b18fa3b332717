//! Typed views over the configuration sections.

use anyhow::{bail, Result};
use std::path::{Component, Path};

use super::{ConfigStore, KERNEL_SECTION, TEMPLATE_SECTION, TOOLCHAIN_SECTION};

/// Branch used when a repository section does not name one.
pub const DEFAULT_BRANCH: &str = "master";

/// `[KERNEL]`: where the kernel tree comes from and how it is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSettings {
    /// Directory name of the tree under `src/`.
    pub name: String,
    pub url: String,
    pub branch: String,
    /// Make target producing `.config`, e.g. `vayu_defconfig`.
    pub defconfig: String,
    /// Build output directory, relative to the base directory unless absolute.
    pub build_dir: String,
}

/// `[CLANG]`: toolchain archive plus the make variables it implies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolchainSettings {
    pub url: String,
    /// Directory name of the extracted toolchain under `requirements/`.
    pub name: String,
    /// Expected sha256 of the archive; `None` disables verification.
    pub sha256: Option<String>,
    pub arch: String,
    pub subarch: String,
    pub cc: String,
    pub cc_ccache: String,
    pub clang_triple: String,
    pub cross_compile: String,
    pub cross_compile_arm32: String,
    pub llvm: bool,
    pub llvm_ias: bool,
    pub lto: bool,
    pub extra_options: String,
}

/// `[ANYKERNEL3]`: packaging template repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSettings {
    pub url: String,
    pub branch: String,
    /// Directory name of the template under `requirements/`.
    pub folder: String,
}

/// All three sections, resolved once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub kernel: KernelSettings,
    pub toolchain: ToolchainSettings,
    pub template: TemplateSettings,
}

impl Settings {
    pub fn load(store: &ConfigStore) -> Result<Self> {
        Ok(Self {
            kernel: KernelSettings::load(store)?,
            toolchain: ToolchainSettings::load(store)?,
            template: TemplateSettings::load(store)?,
        })
    }
}

impl KernelSettings {
    pub fn load(store: &ConfigStore) -> Result<Self> {
        let s = KERNEL_SECTION;
        Ok(Self {
            name: dir_name(store.require(s, "kernel_name")?, "KERNEL.kernel_name")?,
            url: store.require(s, "kernel_url")?.trim().to_string(),
            branch: branch(store.load(s, "kernel_branch")?),
            defconfig: text(store.load(s, "kernel_config")?),
            build_dir: store.require(s, "kernel_build_dir")?.trim().to_string(),
        })
    }
}

impl ToolchainSettings {
    pub fn load(store: &ConfigStore) -> Result<Self> {
        let s = TOOLCHAIN_SECTION;
        Ok(Self {
            url: store.require(s, "clang_url")?.trim().to_string(),
            name: dir_name(store.require(s, "clang_name")?, "CLANG.clang_name")?,
            sha256: store
                .load(s, "clang_sha256")?
                .map(|v| v.trim().to_ascii_lowercase())
                .filter(|v| !v.is_empty()),
            arch: text(store.load(s, "ARCH")?),
            subarch: text(store.load(s, "SUBARCH")?),
            cc: text(store.load(s, "CC")?),
            cc_ccache: text(store.load(s, "CC_CCACHE")?),
            clang_triple: text(store.load(s, "CLANG_TRIPLE")?),
            cross_compile: text(store.load(s, "CROSS_COMPILE")?),
            cross_compile_arm32: text(store.load(s, "CROSS_COMPILE_ARM32")?),
            llvm: toggle(store.load(s, "LLVM")?),
            llvm_ias: toggle(store.load(s, "LLVM_IAS")?),
            lto: toggle(store.load(s, "LTO")?),
            extra_options: text(store.load(s, "extra_options")?),
        })
    }
}

impl TemplateSettings {
    pub fn load(store: &ConfigStore) -> Result<Self> {
        let s = TEMPLATE_SECTION;
        Ok(Self {
            url: store.require(s, "anykernel3_url")?.trim().to_string(),
            branch: branch(store.load(s, "anykernel3_branch")?),
            folder: dir_name(
                store.require(s, "anykernel3_folder")?,
                "ANYKERNEL3.anykernel3_folder",
            )?,
        })
    }
}

fn text(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

fn branch(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(b) if !b.is_empty() => b.to_string(),
        _ => DEFAULT_BRANCH.to_string(),
    }
}

/// Make toggles are on only for the literal `1`.
fn toggle(value: Option<&str>) -> bool {
    value.map(str::trim) == Some("1")
}

/// A single path component that stays inside its parent directory.
fn dir_name(raw: &str, field: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("{field} must not be empty");
    }
    let mut components = Path::new(raw).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(raw.to_string()),
        _ => bail!("{field} must be a plain directory name, got '{raw}'"),
    }
}
