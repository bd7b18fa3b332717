//! Build orchestration for Android-style kernels with a prebuilt clang.
//!
//! One run fetches the kernel tree, a toolchain archive and the AnyKernel3
//! packaging template, puts the toolchain on the search path of child
//! processes, and drives `make <defconfig>` followed by `make`.
//!
//! - **Configuration** - TOML file with `KERNEL`, `CLANG` and `ANYKERNEL3` tables
//! - **Fetching** - git clone/pull or streamed, resumable downloads
//! - **Extraction** - tarballs with explicit handling of non-empty targets
//! - **Command assembly** - `make` argument vector from the toolchain table
//! - **Pipeline** - the fixed step sequence, with injectable collaborators
//!
//! # Architecture
//!
//! ```text
//! kernel-builder (binary)
//!     │
//!     ├── config    ──> Settings
//!     ├── host      ──> search path seed (WSL uses a fixed list)
//!     └── pipeline
//!           ├── preflight  (required host tools)
//!           ├── fetch      (SourceFetcher: git / http / local copy)
//!           ├── extract    (ConflictResolver)
//!           ├── command    (BuildCommand)
//!           └── BuildRunner (make, via process::Cmd)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kernel_builder::config::{ConfigStore, Settings};
//! use kernel_builder::extract::ConflictPolicy;
//! use kernel_builder::fetch::Fetcher;
//! use kernel_builder::pipeline::{Layout, MakeRunner, Pipeline};
//! use kernel_builder::ExecContext;
//!
//! let store = ConfigStore::open("config.toml".as_ref())?;
//! let settings = Settings::load(&store)?;
//! let exec = ExecContext::inherit();
//! let mut fetcher = Fetcher::new(exec.clone())?;
//! let mut resolver = ConflictPolicy::detect().resolver();
//!
//! Pipeline::new(
//!     &settings,
//!     Layout::new(".".as_ref(), &settings),
//!     exec,
//!     &mut fetcher,
//!     &mut MakeRunner,
//!     resolver.as_mut(),
//! )
//! .run()?;
//! ```

pub mod command;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod host;
pub mod logger;
pub mod pipeline;
pub mod preflight;
pub mod process;

#[cfg(test)]
mod testutil;

pub use config::{ConfigStore, Settings};
pub use pipeline::{Pipeline, PipelineOptions, Step};
pub use process::{Cmd, ExecContext, Interrupted};
