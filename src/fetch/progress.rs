//! Transfer progress reporting.
//!
//! Progress is drawn on stderr, on a single line that is rewritten in place,
//! so it never interleaves with the log lines on stdout.

use std::io::{IsTerminal, Write};
use std::time::{Duration, Instant};

/// Minimum time between two redraws.
const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

/// Byte counters of a running download.
#[derive(Debug, Clone, Copy)]
pub struct TransferStats {
    /// Bytes on disk, including any resumed prefix.
    pub received: u64,
    /// Expected final size, when the server announced one.
    pub total: Option<u64>,
    /// Bytes that were already on disk when this transfer started.
    pub offset: u64,
    pub started: Instant,
}

impl TransferStats {
    pub fn new(offset: u64, total: Option<u64>) -> Self {
        Self {
            received: offset,
            total,
            offset,
            started: Instant::now(),
        }
    }

    /// Bytes per second over `elapsed`, counting only this transfer.
    pub fn rate_for(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.received - self.offset) as f64 / secs
    }

    /// Estimated time left, if both the total and a non-zero rate are known.
    pub fn eta_for(&self, elapsed: Duration) -> Option<Duration> {
        let total = self.total?;
        let rate = self.rate_for(elapsed);
        if rate <= 0.0 {
            return None;
        }
        let left = total.saturating_sub(self.received) as f64;
        Some(Duration::from_secs_f64(left / rate))
    }

    pub fn percent(&self) -> Option<u64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.received.min(total) * 100) / total),
        }
    }
}

/// Receiver of progress events from a fetch.
pub trait ProgressSink {
    /// Object counting reported by git, e.g. phase `Receiving objects`.
    fn objects(&mut self, phase: &str, current: u64, total: Option<u64>);

    fn bytes(&mut self, stats: &TransferStats);

    /// Called once the transfer is over, successful or not.
    fn finish(&mut self);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn objects(&mut self, _phase: &str, _current: u64, _total: Option<u64>) {}
    fn bytes(&mut self, _stats: &TransferStats) {}
    fn finish(&mut self) {}
}

/// Single-line progress display on stderr.
pub struct TerminalProgress {
    label: String,
    last_draw: Option<Instant>,
    line: String,
}

impl TerminalProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_draw: None,
            line: String::new(),
        }
    }

    fn draw(&mut self, line: String, force: bool) {
        let now = Instant::now();
        let due = self
            .last_draw
            .map_or(true, |t| now.duration_since(t) >= REDRAW_INTERVAL);
        self.line = line;
        if !(due || force) {
            return;
        }
        self.last_draw = Some(now);
        let mut err = std::io::stderr().lock();
        _ = write!(err, "\r{}\x1b[K", self.line);
        _ = err.flush();
    }
}

impl ProgressSink for TerminalProgress {
    fn objects(&mut self, phase: &str, current: u64, total: Option<u64>) {
        let line = match total {
            Some(total) if total > 0 => format!(
                "{}: {phase} {}% ({current}/{total})",
                self.label,
                current.min(total) * 100 / total
            ),
            _ => format!("{}: {phase} {current}", self.label),
        };
        self.draw(line, false);
    }

    fn bytes(&mut self, stats: &TransferStats) {
        let elapsed = stats.started.elapsed();
        let rate = human_bytes(stats.rate_for(elapsed) as u64);
        let line = match (stats.total, stats.percent()) {
            (Some(total), Some(pct)) => {
                let eta = stats
                    .eta_for(elapsed)
                    .map(|d| format!(", {}s left", d.as_secs()))
                    .unwrap_or_default();
                format!(
                    "{}: {pct}% {}/{} {rate}/s{eta}",
                    self.label,
                    human_bytes(stats.received),
                    human_bytes(total)
                )
            }
            _ => format!("{}: {} {rate}/s", self.label, human_bytes(stats.received)),
        };
        self.draw(line, false);
    }

    fn finish(&mut self) {
        if self.last_draw.is_none() {
            return;
        }
        let line = std::mem::take(&mut self.line);
        self.draw(line, true);
        let mut err = std::io::stderr().lock();
        _ = writeln!(err);
    }
}

/// Progress sink for a transfer labelled `label`. The terminal display is
/// only used when `enabled` and stderr is a terminal.
pub fn sink(label: &str, enabled: bool) -> Box<dyn ProgressSink> {
    if enabled && std::io::stderr().is_terminal() {
        Box::new(TerminalProgress::new(label))
    } else {
        Box::new(NullProgress)
    }
}

/// `1536` -> `1.5 KiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
