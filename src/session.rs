//! Per-run state
//!
//! A [`Session`] owns everything a single macro run mutates: the variable
//! store, the datasource cursor, the execution state and the transcript.
//! Independent runs use independent sessions.

use std::collections::HashMap;
use std::fmt;

use tokio::time::Instant;

use crate::datasource::Datasource;
use crate::error::{ErrorCode, MacroError};
use crate::vars::VariableStore;

/// Where a run is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Playing,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Playing => "playing",
            RunStatus::Paused => "paused",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Execution state of the current (or last) run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionState {
    pub status: RunStatus,
    /// Index into the macro's command list
    pub current_command: usize,
    /// 1-based loop iteration
    pub loop_iteration: u64,
    /// The error that failed the run, or the last ignored one
    pub last_error: Option<MacroError>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            current_command: 0,
            loop_iteration: 1,
            last_error: None,
        }
    }
}

impl ExecutionState {
    pub fn last_error_code(&self) -> ErrorCode {
        self.last_error.as_ref().map_or(ErrorCode::Ok, |e| e.code)
    }

    pub fn last_error_message(&self) -> Option<&str> {
        self.last_error.as_ref().map(|e| e.message.as_str())
    }

    pub fn last_error_line(&self) -> Option<usize> {
        self.last_error.as_ref().and_then(|e| e.line)
    }
}

/// Human-readable record of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    text: String,
}

impl Transcript {
    /// Append a line
    pub fn logf(&mut self, msg: &str) {
        self.text.push_str(msg);
        if !msg.ends_with('\n') {
            self.text.push('\n');
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// A running stopwatch
#[derive(Debug, Clone, Copy)]
pub(crate) struct Stopwatch {
    pub started: Instant,
}

/// Mutable state for a single macro run
#[derive(Debug, Default)]
pub struct Session {
    pub vars: VariableStore,
    pub datasource: Option<Datasource>,
    pub state: ExecutionState,
    pub log: Transcript,
    pub(crate) stopwatches: HashMap<String, Stopwatch>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a transcript entry
    pub fn logf(&mut self, msg: &str) {
        self.log.logf(msg);
    }

    /// Install a datasource and mirror its current row.
    pub fn attach_datasource(&mut self, ds: Datasource) {
        ds.populate_variables(&mut self.vars);
        self.datasource = Some(ds);
    }

    /// Drop the datasource and clear its mirror.
    pub fn detach_datasource(&mut self) {
        self.datasource = None;
        Datasource::clear_variables(&mut self.vars);
    }

    /// Re-mirror the datasource row after the cursor moved.
    pub fn sync_datasource(&mut self) {
        match &self.datasource {
            Some(ds) => ds.populate_variables(&mut self.vars),
            None => Datasource::clear_variables(&mut self.vars),
        }
    }

    /// Reset run state for a new playback, keeping variables set by the
    /// host beforehand.
    pub(crate) fn begin(&mut self) {
        self.state = ExecutionState {
            status: RunStatus::Playing,
            ..ExecutionState::default()
        };
        self.stopwatches.clear();
        self.vars.clear_extract();
        self.vars.reset_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DatasourceOptions;

    #[test]
    fn test_transcript_lines() {
        let mut log = Transcript::default();
        log.logf("> URL GOTO=x");
        log.logf("[retry 1]\n");
        assert_eq!(log.as_str(), "> URL GOTO=x\n[retry 1]\n");
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn test_datasource_attach_and_detach() {
        let mut session = Session::new();
        let ds = Datasource::load("d.csv", "x,y\nz,w", &DatasourceOptions::default()).unwrap();
        session.attach_datasource(ds);
        assert_eq!(session.vars.get_text("!COL2"), "y");

        if let Some(ds) = session.datasource.as_mut() {
            ds.next();
        }
        session.sync_datasource();
        assert_eq!(session.vars.get_text("!COL1"), "z");

        session.detach_datasource();
        assert_eq!(session.vars.get("!COL1"), None);
        assert_eq!(session.vars.get_text("!DATASOURCE"), "");
    }

    #[test]
    fn test_last_error_accessors() {
        let mut state = ExecutionState::default();
        assert_eq!(state.last_error_code(), ErrorCode::Ok);
        state.last_error =
            Some(MacroError::new(ErrorCode::MissingParameter, "no VALUE").with_line(3));
        assert_eq!(state.last_error_code().code(), -911);
        assert_eq!(state.last_error_line(), Some(3));
        assert_eq!(state.last_error_message(), Some("no VALUE"));
    }
}
