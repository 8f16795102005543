//! Macro engine
//!
//! The Engine holds the handler and built-in registries plus the player
//! configuration. It keeps no per-run state, so one engine can play many
//! macros; everything a run mutates lives in its [`Session`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::builtins::{default_builtins, BoxedBuiltin, BuiltinEnv, Flow};
use crate::command::{Action, CommandKind, Params, TimeoutClass};
use crate::config::{seconds, PlayerConfig, Repeat, ReplaySpeed};
use crate::control::{PlaybackControl, Signal};
use crate::datasource::{DatasourceProvider, FsDatasourceProvider};
use crate::error::{ErrorCode, MacroError};
use crate::expand::{decode_legacy, expand};
use crate::handler::{BoxedHandler, CommandResult, HandlerContext};
use crate::parser::{Macro, ParsedCommand};
use crate::session::{RunStatus, Session};

/// Summary of one call to [`Engine::play`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    /// Number of loop iterations started
    pub iterations: u64,
    /// The error that failed the run, or the last ignored one
    pub last_error: Option<MacroError>,
    /// Joined `!EXTRACT` value of every iteration that extracted something
    pub extracts: Vec<String>,
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// How a single command ended
enum StepEnd {
    Next,
    Stopped,
    Failed(MacroError),
}

/// The macro engine
pub struct Engine {
    handlers: HashMap<CommandKind, BoxedHandler>,
    builtins: HashMap<CommandKind, BoxedBuiltin>,
    config: PlayerConfig,
    datasources: Box<dyn DatasourceProvider>,
}

impl Engine {
    /// Create an engine with the built-in commands and no host handlers.
    /// Datasources are read from `config.datasource_dir`.
    pub fn new(config: PlayerConfig) -> Self {
        let datasources = Box::new(FsDatasourceProvider::new(config.datasource_dir.clone()));
        Self {
            handlers: HashMap::new(),
            builtins: default_builtins(),
            config,
            datasources,
        }
    }

    /// Register the host handler for a command kind. Kinds the interpreter
    /// owns (`SET`, `WAIT`, ...) always run as built-ins.
    pub fn register(&mut self, kind: CommandKind, handler: BoxedHandler) {
        if kind.is_builtin() {
            warn!(command = %kind, "handler ignored for interpreter-owned command");
            return;
        }
        self.handlers.insert(kind, handler);
    }

    /// Replace the datasource provider.
    pub fn with_datasources(mut self, provider: impl DatasourceProvider + 'static) -> Self {
        self.datasources = Box::new(provider);
        self
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Whether a command of this kind can run.
    pub fn handles(&self, kind: CommandKind) -> bool {
        self.builtins.contains_key(&kind) || self.handlers.contains_key(&kind)
    }

    /// Play a macro to a terminal state.
    pub async fn play(
        &self,
        mac: &Macro,
        session: &mut Session,
        control: &PlaybackControl,
    ) -> RunReport {
        let started = Instant::now();
        session.begin();
        if self.config.error_ignore {
            session.vars.set("!ERRORIGNORE", "YES").ok();
        }
        session
            .vars
            .set("!REPLAYSPEED", self.config.replay_speed.as_setting())
            .ok();
        info!(commands = mac.commands.len(), repeat = ?self.config.repeat, "run started");

        let mut extracts = Vec::new();
        let mut first = true;
        let end = 'run: loop {
            session.state.loop_iteration = session.vars.loop_counter();
            debug!(iteration = session.state.loop_iteration, "loop iteration");

            for (index, cmd) in mac.commands.iter().enumerate() {
                session.state.current_command = index;
                match self.step(cmd, session, control, first).await {
                    StepEnd::Next => {}
                    other => break 'run other,
                }
                first = false;
            }

            if !session.vars.extract_values().is_empty() {
                extracts.push(session.vars.get_text("!EXTRACT"));
            }
            if !self.repeats(session) {
                break StepEnd::Next;
            }
            let iteration = session.vars.increment_loop();
            if let Some(ds) = session.datasource.as_mut() {
                ds.next();
            }
            session.vars.clear_extract();
            session.sync_datasource();
            info!(iteration, "next iteration");
        };

        match end {
            StepEnd::Next => session.state.status = RunStatus::Completed,
            StepEnd::Stopped => {
                session.state.status = RunStatus::Stopped;
                session.logf("STOP: stopped by host");
            }
            StepEnd::Failed(e) => {
                session.state.status = RunStatus::Failed;
                session.logf(&format!("FAIL: {}", e));
                session.state.last_error = Some(e);
            }
        }

        let report = RunReport {
            status: session.state.status,
            iterations: session.state.loop_iteration,
            last_error: session.state.last_error.clone(),
            extracts,
            duration: started.elapsed(),
        };
        info!(status = %report.status, iterations = report.iterations, "run finished");
        report
    }

    /// Whether another iteration follows the one that just ended.
    fn repeats(&self, session: &Session) -> bool {
        let has_next = session.datasource.as_ref().map(|ds| ds.has_next());
        match self.config.repeat {
            Repeat::Once => false,
            Repeat::Times(n) => session.vars.loop_counter() < n && has_next != Some(false),
            Repeat::UntilDatasourceEnd => has_next == Some(true),
        }
    }

    /// Run one command through its whole lifecycle: control checks,
    /// expansion, validation, dispatch and error policy.
    async fn step(
        &self,
        cmd: &ParsedCommand,
        session: &mut Session,
        control: &PlaybackControl,
        first: bool,
    ) -> StepEnd {
        if self.hold(session, control).await == Signal::Stop {
            return StepEnd::Stopped;
        }
        if !first {
            let delay = ReplaySpeed::from_setting(&session.vars.get_text("!REPLAYSPEED"))
                .unwrap_or(self.config.replay_speed)
                .delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = control.stopped() => return StepEnd::Stopped,
                }
            }
        }

        session.logf(&format!("> {}", cmd.raw.trim()));
        debug!(line = cmd.line_number, command = %cmd.kind, "dispatch");

        let result = match self.execute(cmd, session, control).await {
            Ok(Flow::Continue) => return StepEnd::Next,
            Ok(Flow::Stopped) => return StepEnd::Stopped,
            Err(e) => e
                .with_line(cmd.line_number)
                .with_command(cmd.kind.keyword()),
        };

        if result.is_abort() || !session.vars.error_ignore() {
            return StepEnd::Failed(result);
        }
        warn!(line = cmd.line_number, code = result.code.code(), "{}", result.message);
        session.logf(&format!("[ignored: {} {}]", result.code, result.message));
        session.state.last_error = Some(result);
        StepEnd::Next
    }

    /// Wait out a host pause before dispatch.
    async fn hold(&self, session: &mut Session, control: &PlaybackControl) -> Signal {
        match control.signal() {
            Signal::Pause => {
                session.state.status = RunStatus::Paused;
                session.logf("[paused]");
                info!("paused by host");
                let signal = control.wait_while_paused().await;
                if signal == Signal::Run {
                    session.state.status = RunStatus::Playing;
                    session.logf("[resumed]");
                }
                signal
            }
            signal => signal,
        }
    }

    async fn execute(
        &self,
        cmd: &ParsedCommand,
        session: &mut Session,
        control: &PlaybackControl,
    ) -> Result<Flow, MacroError> {
        let params = expand_params(&cmd.params, session)?;
        let action = Action::from_params(cmd.kind, &params)?;

        if let Some(builtin) = self.builtins.get(&cmd.kind) {
            let mut env = BuiltinEnv {
                session,
                control,
                config: &self.config,
                datasources: &*self.datasources,
            };
            return builtin.run(&mut env, &action).await;
        }

        let handler = self.handlers.get(&cmd.kind).ok_or_else(|| {
            MacroError::new(
                ErrorCode::HandlerNotConfigured,
                format!("no handler configured for {}", cmd.kind),
            )
        })?;

        let result = match self
            .dispatch(cmd, handler, &action, &params, session, control)
            .await?
        {
            Some(result) => result,
            None => return Ok(Flow::Stopped),
        };
        if action.extracts() {
            if let Some(out) = result.output {
                session.logf(&format!("[extract] {}", out));
                session.vars.add_extract(out);
            }
        }
        Ok(Flow::Continue)
    }

    /// Invoke a host handler, retrying retryable failures inside the
    /// command's timeout window. `Ok(None)` means a stop arrived.
    async fn dispatch(
        &self,
        cmd: &ParsedCommand,
        handler: &BoxedHandler,
        action: &Action,
        params: &Params,
        session: &mut Session,
        control: &PlaybackControl,
    ) -> Result<Option<CommandResult>, MacroError> {
        let class = cmd.kind.timeout_class();
        let timeout = self.timeout(class, session);
        let poll = self.config.poll_interval();
        let started = Instant::now();
        let mut attempt = 1u32;

        loop {
            if control.is_stopped() {
                return Ok(None);
            }
            let result = {
                let mut ctx = HandlerContext::new(
                    cmd.kind,
                    action,
                    params,
                    cmd.line_number,
                    attempt,
                    timeout,
                    &mut session.vars,
                    &mut session.log,
                );
                handler.handle(&mut ctx).await
            };
            if control.is_stopped() {
                debug!(line = cmd.line_number, "discarding result after stop");
                return Ok(None);
            }
            if result.success {
                return Ok(Some(result));
            }
            let error = result
                .to_error()
                .unwrap_or_else(|| MacroError::new(ErrorCode::ExecutionError, "command failed"));
            if !result.is_retryable() || class == TimeoutClass::None {
                return Err(error);
            }
            if started.elapsed() + poll > timeout {
                return Err(MacroError::new(
                    ErrorCode::Timeout,
                    format!(
                        "timed out after {:.1}s: {}",
                        started.elapsed().as_secs_f64(),
                        error.message
                    ),
                ));
            }

            debug!(line = cmd.line_number, attempt, code = error.code.code(), "retrying");
            session.logf(&format!("[retry {}]", attempt));
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = control.stopped() => return Ok(None),
            }
            attempt += 1;
        }
    }

    /// Timeout for a command class. Values set from the macro win over
    /// the config.
    fn timeout(&self, class: TimeoutClass, session: &Session) -> Duration {
        let vars = &session.vars;
        let secs = match class {
            TimeoutClass::Step => vars
                .seconds("!TIMEOUT_STEP")
                .or_else(|| vars.seconds("!TIMEOUT_TAG"))
                .unwrap_or(self.config.timeout_step),
            TimeoutClass::Page | TimeoutClass::None => vars
                .seconds("!TIMEOUT_PAGE")
                .or_else(|| vars.seconds("!TIMEOUT"))
                .unwrap_or(self.config.timeout_page),
        };
        seconds(secs)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(PlayerConfig::default())
    }
}

/// Expand every parameter value. Unquoted values also decode the legacy
/// `<SP>`, `<BR>` and `<TAB>` markers.
fn expand_params(raw: &Params, session: &Session) -> Result<Params, MacroError> {
    let mut params = raw.clone();
    for p in params.iter_mut() {
        let value = expand(&p.value, &session.vars)?;
        p.value = if p.quoted { value } else { decode_legacy(&value) };
    }
    Ok(params)
}
