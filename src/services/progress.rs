//! Progress accounting for a single transfer.
//!
//! [`ProgressState`] only keeps counters. [`LoggingProgress`] wraps any
//! instrument and turns its snapshots into periodic `tracing` lines; nothing
//! in the accounting path draws anything.

use std::time::{Duration, Instant};
use tracing::info;

/// Smoothing constant for the throughput average. Older samples decay with
/// this time constant.
const SPEED_TIME_CONSTANT: Duration = Duration::from_secs(5);

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

/// Receives byte counts from the copy loop.
///
/// Driven from the transfer task only, once per chunk.
pub trait ProgressInstrument: Send {
    fn observe(&mut self, bytes: u64);

    /// Explicitly mark the transfer as finished. Required in unknown-total
    /// mode, where byte counts alone can never signal completion.
    fn mark_complete(&mut self);

    fn snapshot(&self) -> ProgressSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Total size declared by the source.
    Known(u64),
    /// Spinner mode: elapsed time and raw byte counts only.
    Unknown,
}

impl ProgressMode {
    pub fn from_content_length(content_length: Option<u64>) -> Self {
        match content_length {
            Some(total) => Self::Known(total),
            None => Self::Unknown,
        }
    }
}

/// Plain view of the instrument for presentation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub mode: ProgressMode,
    pub bytes_written: u64,
    pub percentage: Option<u8>,
    /// Smoothed bytes per second.
    pub throughput: f64,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressState {
    mode: ProgressMode,
    bytes_written: u64,
    started: Instant,
    last_sample: Instant,
    // bytes observed since `last_sample` that have not been folded into
    // `speed` yet (several chunks can land on the same instant)
    pending: u64,
    speed: Option<f64>,
    complete: bool,
}

impl ProgressState {
    pub fn new(content_length: Option<u64>) -> Self {
        Self::starting_at(content_length, Instant::now())
    }

    fn starting_at(content_length: Option<u64>, now: Instant) -> Self {
        Self {
            mode: ProgressMode::from_content_length(content_length),
            bytes_written: 0,
            started: now,
            last_sample: now,
            pending: 0,
            speed: None,
            complete: false,
        }
    }

    pub fn mode(&self) -> ProgressMode {
        self.mode
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whole-number completion percentage, floored. Reports 100 only once
    /// every declared byte has been written. `None` in spinner mode.
    pub fn percentage(&self) -> Option<u8> {
        match self.mode {
            ProgressMode::Unknown => None,
            ProgressMode::Known(0) => Some(100),
            ProgressMode::Known(total) if self.bytes_written >= total => Some(100),
            ProgressMode::Known(total) => {
                let pct = (self.bytes_written as u128 * 100) / total as u128;
                Some(pct.min(99) as u8)
            }
        }
    }

    /// Smoothed throughput in bytes per second.
    pub fn throughput(&self) -> f64 {
        self.speed.unwrap_or(0.0)
    }

    /// Estimated time remaining, derived from the smoothed throughput.
    pub fn eta(&self) -> Option<Duration> {
        let ProgressMode::Known(total) = self.mode else {
            return None;
        };
        let remaining = total.saturating_sub(self.bytes_written);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let speed = self.throughput();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_complete(&self) -> bool {
        match self.mode {
            ProgressMode::Known(total) => self.complete || self.bytes_written >= total,
            ProgressMode::Unknown => self.complete,
        }
    }

    fn observe_at(&mut self, bytes: u64, now: Instant) {
        self.bytes_written = self.bytes_written.saturating_add(bytes);
        self.pending = self.pending.saturating_add(bytes);

        let dt = now.saturating_duration_since(self.last_sample);
        if dt.is_zero() {
            return;
        }
        let sample = self.pending as f64 / dt.as_secs_f64();
        // time-weighted EWMA: a long gap weighs the new sample more
        let alpha = 1.0 - (-dt.as_secs_f64() / SPEED_TIME_CONSTANT.as_secs_f64()).exp();
        self.speed = Some(match self.speed {
            Some(prev) => prev + alpha * (sample - prev),
            None => sample,
        });
        self.pending = 0;
        self.last_sample = now;
    }
}

impl ProgressInstrument for ProgressState {
    fn observe(&mut self, bytes: u64) {
        self.observe_at(bytes, Instant::now());
    }

    fn mark_complete(&mut self) {
        self.complete = true;
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            mode: self.mode,
            bytes_written: self.bytes_written,
            percentage: self.percentage(),
            throughput: self.throughput(),
            eta: self.eta(),
            elapsed: self.elapsed(),
            complete: self.is_complete(),
        }
    }
}

/// Emits a progress line through `tracing` at most once per `interval`, and
/// once more when the transfer is marked complete.
pub struct LoggingProgress<I> {
    inner: I,
    interval: Duration,
    last_emit: Option<Instant>,
    ticks: usize,
}

impl<I: ProgressInstrument> LoggingProgress<I> {
    pub fn new(inner: I, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last_emit: None,
            ticks: 0,
        }
    }

    pub fn into_inner(self) -> I {
        self.inner
    }

    fn emit(&mut self) {
        let snap = self.inner.snapshot();
        self.ticks = self.ticks.wrapping_add(1);
        self.last_emit = Some(Instant::now());

        match snap.mode {
            ProgressMode::Known(total) => info!(
                "{} / {} {:>3}% | eta {} | {}/s",
                format_kib(snap.bytes_written),
                format_kib(total),
                snap.percentage.unwrap_or(0),
                snap.eta
                    .map(format_duration)
                    .unwrap_or_else(|| "--".to_string()),
                format_kib(snap.throughput as u64),
            ),
            ProgressMode::Unknown => {
                let glyph = if snap.complete {
                    '✓'
                } else {
                    SPINNER[self.ticks % SPINNER.len()]
                };
                info!(
                    "{} {} | {}",
                    glyph,
                    format_duration(snap.elapsed),
                    format_kib(snap.bytes_written)
                )
            }
        }
    }
}

impl<I: ProgressInstrument> ProgressInstrument for LoggingProgress<I> {
    fn observe(&mut self, bytes: u64) {
        self.inner.observe(bytes);
        let due = self
            .last_emit
            .is_none_or(|last| last.elapsed() >= self.interval);
        if due {
            self.emit();
        }
    }

    fn mark_complete(&mut self) {
        self.inner.mark_complete();
        self.emit();
    }

    fn snapshot(&self) -> ProgressSnapshot {
        self.inner.snapshot()
    }
}

/// Format a byte count in KiB with two decimals.
pub fn format_kib(bytes: u64) -> String {
    format!("{:.2} KiB", bytes as f64 / 1024.0)
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
