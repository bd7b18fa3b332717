//! The build sequence.
//!
//! ```text
//! CheckPrerequisites -> PrepareDirectories -> FetchKernel -> FetchToolchain
//!   -> ExtractToolchain -> FetchTemplate -> ExportToolchainPath
//!   -> ConfigureKernel (make <defconfig>) -> BuildKernel (make)
//! ```
//!
//! Steps run strictly in order and the first failure stops the run. Nothing
//! is rolled back: a rerun picks up fetched sources and extracted toolchains
//! as they were left.

pub mod layout;

use anyhow::{bail, Result};
use std::fmt;
use std::path::Path;
use std::time::Instant;

use crate::command::{self, BuildCommand};
use crate::config::Settings;
use crate::extract::{extract_archive, ConflictResolver};
use crate::fetch::{self, FetchOutcome, SourceDescriptor, SourceFetcher};
use crate::preflight::{check_required_tools, command_exists, REQUIRED_TOOLS};
use crate::process::ExecContext;
pub use layout::Layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    CheckPrerequisites,
    PrepareDirectories,
    FetchKernel,
    FetchToolchain,
    ExtractToolchain,
    FetchTemplate,
    ExportToolchainPath,
    ConfigureKernel,
    BuildKernel,
}

impl Step {
    pub const ALL: [Step; 9] = [
        Step::CheckPrerequisites,
        Step::PrepareDirectories,
        Step::FetchKernel,
        Step::FetchToolchain,
        Step::ExtractToolchain,
        Step::FetchTemplate,
        Step::ExportToolchainPath,
        Step::ConfigureKernel,
        Step::BuildKernel,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Step::CheckPrerequisites => "check prerequisites",
            Step::PrepareDirectories => "prepare directories",
            Step::FetchKernel => "fetch kernel source",
            Step::FetchToolchain => "fetch toolchain",
            Step::ExtractToolchain => "extract toolchain",
            Step::FetchTemplate => "fetch packaging template",
            Step::ExportToolchainPath => "export toolchain path",
            Step::ConfigureKernel => "configure kernel",
            Step::BuildKernel => "build kernel",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Runs one `make` invocation to completion.
pub trait BuildRunner {
    fn run(
        &mut self,
        command: &BuildCommand,
        working_dir: &Path,
        exec: &ExecContext,
    ) -> Result<()>;
}

/// Runs make with the terminal attached and logs its wall-clock time.
#[derive(Debug, Default)]
pub struct MakeRunner;

impl BuildRunner for MakeRunner {
    fn run(
        &mut self,
        command: &BuildCommand,
        working_dir: &Path,
        exec: &ExecContext,
    ) -> Result<()> {
        log::info!("Running: {command}");
        let started = Instant::now();
        command
            .to_cmd()
            .current_dir(working_dir)
            .exec_context(exec)
            .error_msg(format!("{} failed in {}", command, working_dir.display()))
            .run_interactive()?;
        log::info!(
            "Execution time: {:.2} seconds",
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// (command, package) pairs checked before anything touches the disk.
    pub required_tools: &'static [(&'static str, &'static str)],
    /// `-j` value; the host's CPU count when `None`.
    pub jobs: Option<usize>,
    /// Stop after this step.
    pub last_step: Step,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            required_tools: REQUIRED_TOOLS,
            jobs: None,
            last_step: Step::BuildKernel,
        }
    }
}

pub struct Pipeline<'a> {
    settings: &'a Settings,
    layout: Layout,
    exec: ExecContext,
    fetcher: &'a mut dyn SourceFetcher,
    runner: &'a mut dyn BuildRunner,
    resolver: &'a mut dyn ConflictResolver,
    options: PipelineOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        settings: &'a Settings,
        layout: Layout,
        exec: ExecContext,
        fetcher: &'a mut dyn SourceFetcher,
        runner: &'a mut dyn BuildRunner,
        resolver: &'a mut dyn ConflictResolver,
    ) -> Self {
        Self {
            settings,
            layout,
            exec,
            fetcher,
            runner,
            resolver,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Search path children currently run with.
    pub fn exec_context(&self) -> &ExecContext {
        &self.exec
    }

    /// The base make command, without a target.
    pub fn make_command(&self) -> BuildCommand {
        let jobs = self.options.jobs.unwrap_or_else(command::host_jobs);
        let ccache = command_exists(&self.exec, "ccache");
        command::assemble(&self.settings.toolchain, &self.layout.build_dir, jobs, ccache)
    }

    pub fn run(&mut self) -> Result<()> {
        for step in Step::ALL {
            if step > self.options.last_step {
                break;
            }
            log::debug!("Step: {step}");
            self.run_step(step)?;
        }
        Ok(())
    }

    fn run_step(&mut self, step: Step) -> Result<()> {
        let settings = self.settings;
        match step {
            Step::CheckPrerequisites => {
                check_required_tools(&self.exec, self.options.required_tools)?;
            }
            Step::PrepareDirectories => self.layout.prepare()?,
            Step::FetchKernel => {
                let source =
                    SourceDescriptor::new(&settings.kernel.url, &self.layout.kernel_root)
                        .with_branch(&settings.kernel.branch);
                self.fetcher.fetch(&source)?;
            }
            Step::FetchToolchain => {
                let source = SourceDescriptor::new(
                    &settings.toolchain.url,
                    &self.layout.toolchain_archive,
                );
                let outcome = self.fetcher.fetch(&source)?;
                if let Some(expected) = &settings.toolchain.sha256 {
                    if !matches!(outcome, FetchOutcome::Cloned | FetchOutcome::Updated) {
                        fetch::verify_sha256(&self.layout.toolchain_archive, expected)?;
                    }
                }
            }
            Step::ExtractToolchain => {
                extract_archive(
                    &self.layout.toolchain_archive,
                    &self.layout.toolchain_dir,
                    &mut *self.resolver,
                )?;
            }
            Step::FetchTemplate => {
                let source =
                    SourceDescriptor::new(&settings.template.url, &self.layout.template_dir)
                        .with_branch(&settings.template.branch);
                self.fetcher.fetch(&source)?;
            }
            Step::ExportToolchainPath => {
                let bin = layout::locate_toolchain_bin(&self.layout.toolchain_dir);
                self.exec = self.exec.with_prepended_path(&bin)?;
                log::info!("PATH: {}", self.exec.search_path().to_string_lossy());
            }
            Step::ConfigureKernel => {
                self.require_kernel_root()?;
                let defconfig = settings.kernel.defconfig.trim();
                if defconfig.is_empty() {
                    bail!("KERNEL.kernel_config is empty; name a defconfig target");
                }
                let command = self.make_command().with_target(defconfig);
                self.runner
                    .run(&command, &self.layout.kernel_root, &self.exec)?;
            }
            Step::BuildKernel => {
                self.require_kernel_root()?;
                let command = self.make_command();
                self.runner
                    .run(&command, &self.layout.kernel_root, &self.exec)?;
            }
        }
        Ok(())
    }

    fn require_kernel_root(&self) -> Result<()> {
        if !self.layout.kernel_root.is_dir() {
            bail!(
                "kernel source directory {} does not exist",
                self.layout.kernel_root.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelSettings, TemplateSettings, ToolchainSettings};
    use crate::extract::Resolution;
    use crate::fetch::Fetcher;
    use crate::testutil;
    use reqwest::blocking::Client;
    use std::ffi::OsString;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Vec<(Vec<String>, PathBuf, OsString)>,
    }

    impl BuildRunner for RecordingRunner {
        fn run(
            &mut self,
            command: &BuildCommand,
            working_dir: &Path,
            exec: &ExecContext,
        ) -> Result<()> {
            self.calls.push((
                command.tokens().to_vec(),
                working_dir.to_path_buf(),
                exec.search_path().to_os_string(),
            ));
            Ok(())
        }
    }

    /// Materializes every source locally without git or network.
    #[derive(Default)]
    struct FakeFetcher {
        fetched: Vec<SourceDescriptor>,
        skip_kernel: bool,
    }

    impl SourceFetcher for FakeFetcher {
        fn fetch(&mut self, source: &SourceDescriptor) -> Result<FetchOutcome> {
            self.fetched.push(source.clone());
            let dest = &source.destination;
            if dest.to_string_lossy().ends_with(".tar.gz") {
                testutil::tar_gz(dest, &[("bin/clang", "#!/bin/sh\n")]);
                return Ok(FetchOutcome::Downloaded { bytes: 0 });
            }
            if self.skip_kernel && dest.ends_with("src/super") {
                return Ok(FetchOutcome::Skipped);
            }
            fs::create_dir_all(dest)?;
            Ok(FetchOutcome::Cloned)
        }
    }

    fn settings(kernel_url: String, toolchain_url: String, template_url: String) -> Settings {
        Settings {
            kernel: KernelSettings {
                name: "super".into(),
                url: kernel_url,
                branch: "main".into(),
                defconfig: "vayu_defconfig".into(),
                build_dir: "build".into(),
            },
            toolchain: ToolchainSettings {
                url: toolchain_url,
                name: "aosp_clang".into(),
                arch: "arm64".into(),
                cc: "clang".into(),
                llvm: true,
                ..Default::default()
            },
            template: TemplateSettings {
                url: template_url,
                branch: "master".into(),
                folder: "anykernel3".into(),
            },
        }
    }

    fn fake_settings() -> Settings {
        settings(
            "https://example.com/kernel.git".into(),
            "https://example.com/clang.tar.gz".into(),
            "https://example.com/AnyKernel3.git".into(),
        )
    }

    fn options(last_step: Step) -> PipelineOptions {
        PipelineOptions {
            required_tools: &[("sh", "dash")],
            jobs: Some(2),
            last_step,
        }
    }

    #[test]
    fn local_sources_end_to_end() {
        let temp = TempDir::new().unwrap();
        let kernel = testutil::init_repo(&temp.path().join("origin/kernel"), "main");
        let template = testutil::init_repo(&temp.path().join("origin/anykernel3"), "master");
        let archive = temp.path().join("origin/clang-r383902.tar.gz");
        testutil::tar_gz(&archive, &[("bin/clang", "#!/bin/sh\n"), ("lib/libclang.so", "so")]);

        let settings = settings(
            format!("file://{}", kernel.display()),
            archive.to_string_lossy().into_owned(),
            format!("file://{}", template.display()),
        );
        let base = temp.path().join("work");
        let layout = Layout::new(&base, &settings);
        let client = Client::builder().no_proxy().build().unwrap();
        let mut fetcher =
            Fetcher::with_client(client, ExecContext::inherit()).with_progress(false);
        let mut runner = RecordingRunner::default();

        let mut resolver = Resolution::Abort;
        Pipeline::new(
            &settings,
            layout.clone(),
            ExecContext::inherit(),
            &mut fetcher,
            &mut runner,
            &mut resolver,
        )
        .with_options(PipelineOptions {
            required_tools: &[("git", "git")],
            jobs: Some(2),
            last_step: Step::BuildKernel,
        })
        .run()
        .unwrap();

        assert_eq!(testutil::current_branch(&base.join("src/super")), "main");
        assert!(base.join("requirements/aosp_clang/bin/clang").is_file());
        assert!(base.join("requirements/aosp_clang/lib/libclang.so").is_file());
        assert!(base.join("requirements/anykernel3/README").is_file());
        assert!(base.join("build").is_dir());

        assert_eq!(runner.calls.len(), 2);
        let (config, build) = (&runner.calls[0], &runner.calls[1]);
        assert_eq!(config.0.last().map(String::as_str), Some("vayu_defconfig"));
        assert_eq!(config.0[..config.0.len() - 1], build.0[..]);
        assert_eq!(config.1, layout.kernel_root);
        let bin = layout.toolchain_dir.join("bin");
        let search_path = config.2.to_string_lossy();
        assert!(
            search_path.starts_with(&format!("{}:", bin.display())),
            "{search_path}"
        );

        // A second run updates the clones, keeps the archive and skips
        // re-extraction.
        let mut resolver = Resolution::Skip;
        Pipeline::new(
            &settings,
            layout,
            ExecContext::inherit(),
            &mut fetcher,
            &mut runner,
            &mut resolver,
        )
        .with_options(options(Step::BuildKernel))
        .run()
        .unwrap();
        assert_eq!(runner.calls.len(), 4);
    }

    #[test]
    fn sources_are_fetched_in_order_with_branches() {
        let temp = TempDir::new().unwrap();
        let settings = fake_settings();
        let mut fetcher = FakeFetcher::default();
        let mut runner = RecordingRunner::default();
        let mut resolver = Resolution::Abort;

        Pipeline::new(
            &settings,
            Layout::new(temp.path(), &settings),
            ExecContext::new("/usr/bin:/bin"),
            &mut fetcher,
            &mut runner,
            &mut resolver,
        )
        .with_options(options(Step::BuildKernel))
        .run()
        .unwrap();

        let urls: Vec<&str> = fetcher.fetched.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            [
                "https://example.com/kernel.git",
                "https://example.com/clang.tar.gz",
                "https://example.com/AnyKernel3.git",
            ]
        );
        assert_eq!(fetcher.fetched[0].branch, "main");
        assert_eq!(fetcher.fetched[2].branch, "master");

        let expected_path = format!(
            "{}:/usr/bin:/bin",
            temp.path().join("requirements/aosp_clang/bin").display()
        );
        assert_eq!(runner.calls[1].2, OsString::from(expected_path));
        assert!(runner.calls[1].0.contains(&"ARCH=arm64".to_string()));
        assert!(runner.calls[1].0.contains(&"LLVM=1".to_string()));
        assert!(runner.calls[1].0.contains(&"-j2".to_string()));
    }

    #[test]
    fn fetch_only_runs_no_make() {
        let temp = TempDir::new().unwrap();
        let settings = fake_settings();
        let mut fetcher = FakeFetcher::default();
        let mut runner = RecordingRunner::default();
        let mut resolver = Resolution::Abort;

        let mut pipeline = Pipeline::new(
            &settings,
            Layout::new(temp.path(), &settings),
            ExecContext::new("/usr/bin:/bin"),
            &mut fetcher,
            &mut runner,
            &mut resolver,
        )
        .with_options(options(Step::ExportToolchainPath));
        pipeline.run().unwrap();
        assert!(pipeline
            .exec_context()
            .search_path()
            .to_string_lossy()
            .ends_with("aosp_clang/bin:/usr/bin:/bin"));
        drop(pipeline);

        assert!(runner.calls.is_empty());
        assert_eq!(fetcher.fetched.len(), 3);
    }

    #[test]
    fn missing_kernel_root_stops_before_make() {
        let temp = TempDir::new().unwrap();
        let settings = fake_settings();
        let mut fetcher = FakeFetcher {
            skip_kernel: true,
            ..Default::default()
        };
        let mut runner = RecordingRunner::default();
        let mut resolver = Resolution::Abort;

        let err = Pipeline::new(
            &settings,
            Layout::new(temp.path(), &settings),
            ExecContext::inherit(),
            &mut fetcher,
            &mut runner,
            &mut resolver,
        )
        .with_options(options(Step::BuildKernel))
        .run()
        .unwrap_err();

        assert!(format!("{err}").contains("does not exist"), "{err}");
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn missing_tool_aborts_before_side_effects() {
        let temp = TempDir::new().unwrap();
        let settings = fake_settings();
        let mut fetcher = FakeFetcher::default();
        let mut runner = RecordingRunner::default();
        let mut resolver = Resolution::Abort;

        let err = Pipeline::new(
            &settings,
            Layout::new(temp.path(), &settings),
            ExecContext::inherit(),
            &mut fetcher,
            &mut runner,
            &mut resolver,
        )
        .with_options(PipelineOptions {
            required_tools: &[("definitely_not_a_real_command_12345", "fake-package")],
            jobs: Some(1),
            last_step: Step::BuildKernel,
        })
        .run()
        .unwrap_err();

        assert!(format!("{err}").contains("fake-package"));
        assert!(fetcher.fetched.is_empty());
        assert!(!temp.path().join("requirements").exists());
    }

    #[test]
    fn make_failure_halts_the_sequence() {
        struct FailingRunner(usize);
        impl BuildRunner for FailingRunner {
            fn run(&mut self, _: &BuildCommand, _: &Path, _: &ExecContext) -> Result<()> {
                self.0 += 1;
                bail!("make exited with status 2")
            }
        }

        let temp = TempDir::new().unwrap();
        let settings = fake_settings();
        let mut fetcher = FakeFetcher::default();
        let mut runner = FailingRunner(0);
        let mut resolver = Resolution::Abort;

        let result = Pipeline::new(
            &settings,
            Layout::new(temp.path(), &settings),
            ExecContext::inherit(),
            &mut fetcher,
            &mut runner,
            &mut resolver,
        )
        .with_options(options(Step::BuildKernel))
        .run();

        assert!(result.is_err());
        assert_eq!(runner.0, 1);
    }

    #[test]
    fn steps_are_ordered() {
        let mut sorted = Step::ALL;
        sorted.sort();
        assert_eq!(sorted, Step::ALL);
        assert_eq!(Step::ALL[0], Step::CheckPrerequisites);
        assert_eq!(Step::ALL[8], Step::BuildKernel);
    }
}
