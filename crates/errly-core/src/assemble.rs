//! Stack-trace assembly.
//!
//! A per-deployment state machine that merges continuation lines into one
//! logical error. Strictly single-threaded with respect to one deployment's
//! line stream; all time is caller-supplied epoch milliseconds so the
//! surrounding service owns the idle-timeout timer.
//!
//! Completed errors leave the assembler on two separate paths:
//!
//! - **Line-driven**: [`Assembler::feed`] returns the completion its line
//!   caused - a single-line error, or the open trace flushed because the
//!   line does not continue it (including the line-cap flush).
//! - **Out-of-band**: flushes with no caller blocked on the result - the
//!   idle timeout ([`Assembler::fire_idle_timeout`]) and the stale-gap
//!   flush inside `feed` - go to the registered completion callback.
//!   Without a callback those completions are discarded, so owners must
//!   register one before feeding.
//!
//! Partial traces are flushed intact - losing the tail of a stack by
//! timeout is preferred to unbounded waiting.

use crate::classify::{classify, continues_trace, infer_language, is_trace_start, Language};
use crate::types::Severity;

/// Maximum buffered lines per trace; the buffer flushes when full.
pub const MAX_TRACE_LINES: usize = 100;

/// Idle window after which a partially collected trace is flushed.
pub const IDLE_FLUSH_MS: i64 = 2_000;

/// A completed logical error produced by the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledError {
    /// Error message (the trimmed first line).
    pub message: String,
    /// Buffered lines joined by `\n`, or `None` for single-line errors.
    pub stack_trace: Option<String>,
    /// Severity taken from the first line.
    pub severity: Severity,
    /// Endpoint extracted from the first line, if any.
    pub endpoint: Option<String>,
    /// The raw first line, unmodified.
    pub raw_log: String,
}

/// Receives completions that have no synchronous caller.
pub type CompletionCallback = Box<dyn FnMut(AssembledError) + Send>;

/// Assembler states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblerState {
    /// Waiting for an error line.
    #[default]
    Idle,
    /// Accumulating continuation lines of an open trace.
    Collecting,
}

/// Per-deployment trace assembler.
pub struct Assembler {
    state: AssemblerState,
    buffer: Vec<String>,
    language: Language,
    severity: Severity,
    endpoint: Option<String>,
    message: String,
    raw_log: String,
    last_line_at: i64,
    on_completion: Option<CompletionCallback>,
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("state", &self.state)
            .field("buffered_lines", &self.buffer.len())
            .field("last_line_at", &self.last_line_at)
            .field("has_callback", &self.on_completion.is_some())
            .finish()
    }
}

impl Assembler {
    /// Create an idle assembler with no completion callback.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AssemblerState::Idle,
            buffer: Vec::new(),
            language: Language::Unknown,
            severity: Severity::Error,
            endpoint: None,
            message: String::new(),
            raw_log: String::new(),
            last_line_at: 0,
            on_completion: None,
        }
    }

    /// Create an assembler with the out-of-band completion callback.
    #[must_use]
    pub fn with_completion_callback(callback: CompletionCallback) -> Self {
        let mut assembler = Self::new();
        assembler.on_completion = Some(callback);
        assembler
    }

    /// Register (or replace) the out-of-band completion callback.
    pub fn set_completion_callback(&mut self, callback: CompletionCallback) {
        self.on_completion = Some(callback);
    }

    /// Current state, for the owner's timer bookkeeping.
    #[must_use]
    pub const fn state(&self) -> AssemblerState {
        self.state
    }

    /// Feed one log line; returns the completion this line caused, if any.
    ///
    /// A gap longer than the idle window first closes the open trace
    /// through the completion callback, exactly as the idle timer would
    /// have; the new line is then treated as if received in idle. In the
    /// rare case where a line both displaces an open trace and completes
    /// on its own, the displaced flush keeps the return slot and the
    /// line's own completion goes out of band. At most one completed
    /// error is ever emitted per contiguous trace, whatever terminates it
    /// (non-continuation line, the line cap, or the idle window).
    pub fn feed(&mut self, line: &str, ts_ms: i64) -> Option<AssembledError> {
        if self.state == AssemblerState::Collecting
            && ts_ms - self.last_line_at > IDLE_FLUSH_MS
        {
            if let Some(done) = self.flush() {
                self.emit_out_of_band(done);
            }
        }

        match self.state {
            AssemblerState::Idle => self.feed_idle(line, ts_ms),
            AssemblerState::Collecting => {
                if continues_trace(self.language, line) {
                    self.buffer.push(line.to_owned());
                    self.last_line_at = ts_ms;
                    if self.buffer.len() >= MAX_TRACE_LINES {
                        return self.flush();
                    }
                    None
                } else {
                    let displaced = self.flush();
                    if let Some(own) = self.feed_idle(line, ts_ms) {
                        self.emit_out_of_band(own);
                    }
                    displaced
                }
            }
        }
    }

    /// Timer-driven flush: close the open trace if the idle window has
    /// elapsed, delivering it through the completion callback.
    ///
    /// Returns whether a trace was flushed, so the owner can re-arm.
    pub fn fire_idle_timeout(&mut self, now_ms: i64) -> bool {
        if self.state == AssemblerState::Collecting
            && now_ms - self.last_line_at >= IDLE_FLUSH_MS
        {
            if let Some(done) = self.flush() {
                self.emit_out_of_band(done);
                return true;
            }
        }
        false
    }

    /// Unconditionally flush whatever is buffered.
    pub fn flush(&mut self) -> Option<AssembledError> {
        if self.state != AssemblerState::Collecting {
            return None;
        }
        let stack_trace = Some(self.buffer.join("\n"));
        let done = AssembledError {
            message: std::mem::take(&mut self.message),
            stack_trace,
            severity: self.severity,
            endpoint: self.endpoint.take(),
            raw_log: std::mem::take(&mut self.raw_log),
        };
        self.buffer.clear();
        self.state = AssemblerState::Idle;
        Some(done)
    }

    fn feed_idle(&mut self, line: &str, ts_ms: i64) -> Option<AssembledError> {
        let classification = classify(line);
        if !classification.is_error {
            return None;
        }

        if is_trace_start(line) {
            self.state = AssemblerState::Collecting;
            self.buffer.clear();
            self.buffer.push(line.to_owned());
            self.language = infer_language(line);
            self.severity = classification.severity;
            self.endpoint = classification.endpoint;
            self.message = classification.message;
            self.raw_log = line.to_owned();
            self.last_line_at = ts_ms;
            None
        } else {
            Some(AssembledError {
                message: classification.message,
                stack_trace: None,
                severity: classification.severity,
                endpoint: classification.endpoint,
                raw_log: line.to_owned(),
            })
        }
    }

    fn emit_out_of_band(&mut self, done: AssembledError) {
        if let Some(callback) = self.on_completion.as_mut() {
            callback(done);
        }
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}
