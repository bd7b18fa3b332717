use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kernel_builder::command::{self, build_sequence};
use kernel_builder::config::{self, ConfigStore, Settings, DEFAULT_CONFIG_FILENAME};
use kernel_builder::extract::ConflictPolicy;
use kernel_builder::fetch::Fetcher;
use kernel_builder::host::HostInfo;
use kernel_builder::pipeline::layout::locate_toolchain_bin;
use kernel_builder::pipeline::{Layout, MakeRunner, Pipeline, PipelineOptions, Step};
use kernel_builder::preflight::command_exists;
use kernel_builder::{logger, ExecContext, Interrupted};

#[derive(Parser)]
#[command(name = "kernel-builder", version)]
#[command(about = "Fetch a kernel tree, a prebuilt clang and AnyKernel3, then build the kernel")]
struct Cli {
    /// Directory holding config.toml, src/, requirements/ and the build output.
    #[arg(long, value_name = "DIR")]
    base_dir: Option<PathBuf>,

    /// Configuration file; relative paths are taken from the base directory.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// What to do when the toolchain directory is not empty:
    /// abort, overwrite, skip or ask. Defaults to ask on a terminal, abort otherwise.
    #[arg(long, value_name = "POLICY")]
    on_conflict: Option<ConflictPolicy>,

    /// Parallel make jobs (default: number of CPUs).
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Do not draw download and clone progress.
    #[arg(long)]
    no_progress: bool,

    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
enum Cmd {
    /// Fetch everything and build the kernel (default).
    Build,
    /// Fetch and extract sources without running make.
    Fetch,
    /// Print the make command lines a build would run.
    ShowCommand,
    /// Print what was detected about this machine.
    Host,
    /// Write the default configuration file if it does not exist.
    InitConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(if cli.verbose {
        log::LevelFilter::Debug
    } else if cli.quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    });

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err.chain().any(|cause| cause.is::<Interrupted>()) {
                log::info!("Terminating...");
            } else {
                log::error!("{err:#}");
            }
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let base_dir = resolve_base_dir(cli.base_dir.as_deref())?;
    let config_path = match &cli.config {
        Some(path) => base_dir.join(path),
        None => base_dir.join(DEFAULT_CONFIG_FILENAME),
    };

    match cli.cmd.unwrap_or(Cmd::Build) {
        Cmd::Host => {
            let host = HostInfo::detect();
            println!("Architecture: {}", host.architecture);
            println!("OS:           {}", host.os_family);
            println!("Platform:     {}", host.platform);
            Ok(())
        }
        Cmd::InitConfig => {
            if config_path.exists() {
                println!("{} already exists", config_path.display());
            } else {
                config::write_default_config(&config_path)?;
                println!("{}", config_path.display());
            }
            Ok(())
        }
        Cmd::ShowCommand => show_command(&cli, &base_dir, &config_path),
        cmd @ (Cmd::Build | Cmd::Fetch) => {
            let last_step = if cmd == Cmd::Fetch {
                Step::ExportToolchainPath
            } else {
                Step::BuildKernel
            };
            build(&cli, &base_dir, &config_path, last_step)
        }
    }
}

fn build(cli: &Cli, base_dir: &Path, config_path: &Path, last_step: Step) -> Result<()> {
    let exec = host_exec_context();
    let store = ConfigStore::open(config_path)?;
    let settings = Settings::load(&store)?;
    let layout = Layout::new(base_dir, &settings);

    let policy = cli.on_conflict.unwrap_or_else(ConflictPolicy::detect);
    log::debug!("Conflict policy: {policy}");
    let mut resolver = policy.resolver();
    let mut fetcher = Fetcher::new(exec.clone())?.with_progress(!cli.no_progress);
    let mut runner = MakeRunner;

    Pipeline::new(
        &settings,
        layout,
        exec,
        &mut fetcher,
        &mut runner,
        resolver.as_mut(),
    )
    .with_options(PipelineOptions {
        jobs: cli.jobs,
        last_step,
        ..Default::default()
    })
    .run()?;

    log::info!("Finished: {}", last_step);
    Ok(())
}

fn show_command(cli: &Cli, base_dir: &Path, config_path: &Path) -> Result<()> {
    let store = ConfigStore::open(config_path)?;
    let settings = Settings::load(&store)?;
    let layout = Layout::new(base_dir, &settings);

    let mut exec = host_exec_context();
    if layout.toolchain_dir.is_dir() {
        exec = exec.with_prepended_path(&locate_toolchain_bin(&layout.toolchain_dir))?;
    }
    let jobs = cli.jobs.unwrap_or_else(command::host_jobs);
    let base = command::assemble(
        &settings.toolchain,
        &layout.build_dir,
        jobs,
        command_exists(&exec, "ccache"),
    );
    for cmd in build_sequence(&base, &settings.kernel.defconfig) {
        println!("{cmd}");
    }
    Ok(())
}

fn host_exec_context() -> ExecContext {
    let host = HostInfo::detect();
    log::debug!(
        "Host: {} / {} ({})",
        host.architecture,
        host.os_family,
        host.platform
    );
    ExecContext::new(host.search_path_seed(std::env::var_os("PATH").as_deref()))
}

fn resolve_base_dir(base_dir: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("resolving current directory")?;
    Ok(match base_dir {
        Some(dir) => cwd.join(dir),
        None => cwd,
    })
}
