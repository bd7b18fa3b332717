//! Terminal logger.
//!
//! Lines look like `[06:17:37] | INFO  | Cloning git repository ...` and go to
//! stdout, where they interleave with the output of `make`. Debug and trace
//! records from dependencies (HTTP stack, TLS) are dropped. `RUST_LOG`
//! directives are applied on top of the chosen level.

use std::fmt;
use std::io::Write;
use std::sync::OnceLock;

use env_logger::{Builder as LogBuilder, Target};
use log::LevelFilter;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Local offset sampled once at start-up. Querying it later is refused by
/// `time` once other threads exist.
static OFFSET: OnceLock<UtcOffset> = OnceLock::new();

/// Install the logger. Call once, before any other thread is spawned.
pub fn init(level: LevelFilter) {
    OFFSET.get_or_init(|| UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC));
    if let Err(e) = builder(level).parse_default_env().try_init() {
        log::warn!("logger already installed: {e}");
    }
}

fn builder(level: LevelFilter) -> LogBuilder {
    let mut builder = LogBuilder::new();
    builder
        .target(Target::Stdout)
        .filter_level(level.min(LevelFilter::Info))
        .filter_module(env!("CARGO_CRATE_NAME"), level)
        .format(|buf, record| {
            writeln!(buf, "{}", format_line(&timestamp(), record.level(), record.args()))
        });
    builder
}

fn timestamp() -> String {
    let offset = OFFSET.get().copied().unwrap_or(UtcOffset::UTC);
    OffsetDateTime::now_utc()
        .to_offset(offset)
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| "--:--:--".to_string())
}

fn format_line(time: &str, level: log::Level, args: &fmt::Arguments<'_>) -> String {
    format!("[{time}] | {level:<5} | {args}")
}
