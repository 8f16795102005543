//! Interpreter-owned commands
//!
//! `SET`, `ADD`, `CMDLINE`, `WAIT`, `PAUSE`, `STOPWATCH` and `DS` change run
//! state rather than the page, so the engine runs them itself instead of
//! dispatching to a host handler.

mod data;
mod flow;
mod vars;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::command::{Action, CommandKind};
use crate::config::PlayerConfig;
use crate::control::PlaybackControl;
use crate::datasource::DatasourceProvider;
use crate::error::MacroError;
use crate::session::Session;

/// What the engine does after a built-in finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// A stop request arrived while the command was waiting
    Stopped,
}

/// Usage information for a built-in
pub struct BuiltinUsage {
    pub summary: &'static str,
    pub args: &'static str,
}

/// Everything a built-in may touch
pub struct BuiltinEnv<'a> {
    pub session: &'a mut Session,
    pub control: &'a PlaybackControl,
    pub config: &'a PlayerConfig,
    pub datasources: &'a dyn DatasourceProvider,
}

/// A command run by the interpreter itself
#[async_trait]
pub trait Builtin: Send + Sync {
    async fn run(&self, env: &mut BuiltinEnv<'_>, action: &Action) -> Result<Flow, MacroError>;

    fn usage(&self) -> BuiltinUsage;
}

/// A boxed built-in
pub type BoxedBuiltin = Box<dyn Builtin>;

/// Return the built-in command set
pub fn default_builtins() -> HashMap<CommandKind, BoxedBuiltin> {
    let mut cmds: HashMap<CommandKind, BoxedBuiltin> = HashMap::new();
    cmds.insert(CommandKind::Set, Box::new(vars::SetCmd));
    cmds.insert(CommandKind::Add, Box::new(vars::AddCmd));
    cmds.insert(CommandKind::Cmdline, Box::new(vars::CmdlineCmd));
    cmds.insert(CommandKind::Wait, Box::new(flow::WaitCmd));
    cmds.insert(CommandKind::Pause, Box::new(flow::PauseCmd));
    cmds.insert(CommandKind::Stopwatch, Box::new(flow::StopwatchCmd));
    cmds.insert(CommandKind::Ds, Box::new(data::DsCmd));
    cmds
}

/// Error for an action routed to the wrong built-in
fn mismatch(kind: CommandKind, action: &Action) -> MacroError {
    MacroError::new(
        crate::error::ErrorCode::ExecutionError,
        format!("{} cannot run {:?}", kind, action),
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::datasource::InMemoryDatasources;

    /// Host side of a built-in test
    pub(crate) struct Harness {
        pub session: Session,
        pub control: PlaybackControl,
        pub config: PlayerConfig,
        pub datasources: InMemoryDatasources,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            Self {
                session: Session::new(),
                control: PlaybackControl::new(),
                config: PlayerConfig::default(),
                datasources: InMemoryDatasources::new(),
            }
        }

        /// Parse one line and run it as a built-in, without expansion.
        pub(crate) async fn run(&mut self, line: &str) -> Result<Flow, MacroError> {
            let cmd = crate::parser::parse_line(line, 1)
                .expect("line parses")
                .expect("line is a command");
            let action = Action::from_params(cmd.kind, &cmd.params)?;
            let builtins = default_builtins();
            let builtin = builtins.get(&cmd.kind).expect("built-in command");
            let mut env = BuiltinEnv {
                session: &mut self.session,
                control: &self.control,
                config: &self.config,
                datasources: &self.datasources,
            };
            builtin.run(&mut env, &action).await
        }
    }
}
