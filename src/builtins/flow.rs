//! Timing commands: WAIT, PAUSE, STOPWATCH

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{mismatch, Builtin, BuiltinEnv, BuiltinUsage, Flow};
use crate::command::{Action, CommandKind, StopwatchAction};
use crate::config::seconds;
use crate::control::Signal;
use crate::error::{ErrorCode, MacroError};
use crate::session::{RunStatus, Stopwatch};

// ──────────────────────────────────────────────────────────
// WAIT: sleep, interruptible by stop
// ──────────────────────────────────────────────────────────

pub(super) struct WaitCmd;

#[async_trait]
impl Builtin for WaitCmd {
    async fn run(&self, env: &mut BuiltinEnv<'_>, action: &Action) -> Result<Flow, MacroError> {
        let Action::Wait { seconds: secs } = action else {
            return Err(mismatch(CommandKind::Wait, action));
        };
        env.session.logf(&format!("[wait {}s]", secs));
        tokio::select! {
            _ = tokio::time::sleep(seconds(*secs)) => Ok(Flow::Continue),
            _ = env.control.stopped() => Ok(Flow::Stopped),
        }
    }

    fn usage(&self) -> BuiltinUsage {
        BuiltinUsage {
            summary: "Wait for a number of seconds",
            args: "SECONDS=n",
        }
    }
}

// ──────────────────────────────────────────────────────────
// PAUSE: suspend until the host resumes or stops
// ──────────────────────────────────────────────────────────

pub(super) struct PauseCmd;

#[async_trait]
impl Builtin for PauseCmd {
    async fn run(&self, env: &mut BuiltinEnv<'_>, action: &Action) -> Result<Flow, MacroError> {
        if *action != Action::Pause {
            return Err(mismatch(CommandKind::Pause, action));
        }
        if !env.config.honor_pause {
            env.session.logf("[pause skipped]");
            return Ok(Flow::Continue);
        }

        env.session.state.status = RunStatus::Paused;
        env.session.logf("[paused]");
        info!("paused by macro");
        env.control.pause();
        if env.control.wait_while_paused().await == Signal::Stop {
            return Ok(Flow::Stopped);
        }
        env.session.state.status = RunStatus::Playing;
        env.session.logf("[resumed]");
        Ok(Flow::Continue)
    }

    fn usage(&self) -> BuiltinUsage {
        BuiltinUsage {
            summary: "Pause playback until resumed",
            args: "",
        }
    }
}

// ──────────────────────────────────────────────────────────
// STOPWATCH: measure elapsed time into !STOPWATCHTIME
// ──────────────────────────────────────────────────────────

pub(super) struct StopwatchCmd;

#[async_trait]
impl Builtin for StopwatchCmd {
    async fn run(&self, env: &mut BuiltinEnv<'_>, action: &Action) -> Result<Flow, MacroError> {
        let Action::Stopwatch { id, action: op } = action else {
            return Err(mismatch(CommandKind::Stopwatch, action));
        };
        let session = &mut *env.session;
        let running = session.stopwatches.get(id).copied();

        let op = match (op, running) {
            (StopwatchAction::Toggle, None) => StopwatchAction::Start,
            (StopwatchAction::Toggle, Some(_)) => StopwatchAction::Stop,
            (op, _) => *op,
        };

        match (op, running) {
            (StopwatchAction::Start, None) => {
                session.stopwatches.insert(
                    id.clone(),
                    Stopwatch {
                        started: Instant::now(),
                    },
                );
                debug!(id = %id, "stopwatch started");
            }
            (StopwatchAction::Start, Some(_)) => {
                return Err(MacroError::new(
                    ErrorCode::InvalidParameter,
                    format!("stopwatch {} is already running", id),
                ));
            }
            (StopwatchAction::Stop | StopwatchAction::Lap, Some(sw)) => {
                let elapsed = sw.started.elapsed().as_secs_f64();
                if op == StopwatchAction::Stop {
                    session.stopwatches.remove(id);
                }
                session.vars.set_stopwatch_time(elapsed);
                session.logf(&format!("[stopwatch {}] {:.3}s", id, elapsed));
            }
            (_, None) => {
                return Err(MacroError::new(
                    ErrorCode::InvalidParameter,
                    format!("stopwatch {} is not running", id),
                ));
            }
            (StopwatchAction::Toggle, Some(_)) => {}
        }
        Ok(Flow::Continue)
    }

    fn usage(&self) -> BuiltinUsage {
        BuiltinUsage {
            summary: "Start, stop or lap a named stopwatch",
            args: "ID=name [ACTION=START|STOP|LAP]",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::Harness;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps() {
        let mut h = Harness::new();
        let start = Instant::now();
        assert_eq!(h.run("WAIT SECONDS=2.5").await.unwrap(), Flow::Continue);
        assert!(start.elapsed() >= Duration::from_millis(2500));
        assert!(h.session.log.as_str().contains("[wait 2.5s]"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_wait() {
        let mut h = Harness::new();
        let host = h.control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            host.stop();
        });
        let start = Instant::now();
        assert_eq!(h.run("WAIT SECONDS=100").await.unwrap(), Flow::Stopped);
        assert!(start.elapsed() < Duration::from_secs(100));
    }

    #[tokio::test]
    async fn test_pause_waits_for_resume() {
        let mut h = Harness::new();
        let host = h.control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            host.resume();
        });
        assert_eq!(h.run("PAUSE").await.unwrap(), Flow::Continue);
        assert_eq!(h.session.state.status, RunStatus::Playing);
        let log = h.session.log.as_str();
        assert!(log.contains("[paused]") && log.contains("[resumed]"));
    }

    #[tokio::test]
    async fn test_pause_stop_and_disabled() {
        let mut h = Harness::new();
        h.config.honor_pause = false;
        assert_eq!(h.run("PAUSE").await.unwrap(), Flow::Continue);
        assert_eq!(h.control.signal(), Signal::Run);

        h.config.honor_pause = true;
        h.control.stop();
        assert_eq!(h.run("PAUSE").await.unwrap(), Flow::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopwatch_lap_and_toggle() {
        let mut h = Harness::new();
        h.run("STOPWATCH ID=total ACTION=START").await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        h.run("STOPWATCH ID=total ACTION=LAP").await.unwrap();
        assert_eq!(h.session.vars.get_text("!STOPWATCHTIME"), "1.500");

        tokio::time::advance(Duration::from_millis(500)).await;
        // toggling a running stopwatch stops it
        h.run("STOPWATCH ID=total").await.unwrap();
        assert_eq!(h.session.vars.get_text("!STOPWATCHTIME"), "2.000");

        let err = h.run("STOPWATCH ID=total ACTION=STOP").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
        h.run("STOPWATCH ID=total").await.unwrap();
        let err = h.run("STOPWATCH ID=total ACTION=START").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }
}
