//! imacro-core: interpreter core for an iMacros-compatible macro language
//!
//! # Overview
//!
//! A macro is plain text, one command per line. This crate parses macros,
//! expands `{{...}}` references through a per-run variable store and a
//! sandboxed expression evaluator, and plays the commands one at a time.
//! Commands that touch the browser, the file system or the screen are
//! dispatched to capability handlers registered by the host; the crate
//! itself implements none of them.
//!
//! # Macro Syntax
//!
//! ```text
//! ' comment
//! VERSION BUILD=1.0
//! SET !DATASOURCE people.csv
//! URL GOTO=https://example.com/search?q={{!COL1}}
//! TAG POS=1 TYPE=INPUT:TEXT ATTR=NAME:q CONTENT="{{!COL2}}"
//! TAG POS=1 TYPE=SPAN ATTR=CLASS:price EXTRACT=TXT
//! SET total EVAL("{{!VAR1}} * 2")
//! ```
//!
//! # Interpreter commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `SET` | Assign a variable; `EVAL("...")` evaluates an expression |
//! | `ADD` | Add a number to a variable, or append text |
//! | `CMDLINE` | Take a variable's value from the host |
//! | `WAIT` | Sleep, interruptible by stop |
//! | `PAUSE` | Suspend until the host resumes |
//! | `STOPWATCH` | Measure elapsed time into `!STOPWATCHTIME` |
//! | `DS` | Move the datasource cursor |
//!
//! Every other command goes to a [`CommandHandler`]. Handlers report
//! failures with the legacy numeric [`ErrorCode`]s; element and image
//! misses are retried until the command's timeout runs out and then
//! become `TIMEOUT` (-930).
//!
//! # Example
//!
//! ```rust,ignore
//! let mut engine = Engine::new(PlayerConfig::default());
//! engine.register(CommandKind::Url, handler_fn(|ctx| {
//!     ctx.log(&format!("navigate {}", ctx.param("GOTO").unwrap_or_default()));
//!     CommandResult::ok()
//! }));
//! let mac = parse_macro("URL GOTO=https://example.com")?;
//! let report = engine.play(&mac, &mut Session::new(), &PlaybackControl::new()).await;
//! ```

mod builtins;
mod command;
mod config;
mod control;
mod datasource;
mod engine;
mod error;
mod expand;
mod expr;
mod handler;
mod parser;
mod runner;
mod session;
mod value;
mod vars;

pub use builtins::{default_builtins, BoxedBuiltin, Builtin, BuiltinEnv, BuiltinUsage, Flow};
pub use command::{
    Action, CommandKind, DsCommand, EventSpec, FrameTarget, ImageSpec, Locator, Param,
    ParamLayout, Params, SearchSource, StopwatchAction, TabAction, TagPos, TagSpec, TimeoutClass,
    UrlTarget,
};
pub use config::{PlayerConfig, Repeat, ReplaySpeed};
pub use control::{PlaybackControl, Signal};
pub use datasource::{
    detect_delimiter, Datasource, DatasourceError, DatasourceOptions, DatasourceProvider,
    FsDatasourceProvider, InMemoryDatasources,
};
pub use engine::{Engine, RunReport};
pub use error::{ErrorCode, MacroError};
pub use expand::{decode_legacy, expand, is_variable_name};
pub use expr::{evaluate, EvalError, Outcome, VariableSource, FUNCTIONS, MAX_SOURCE_LEN};
pub use handler::{handler_fn, BoxedHandler, CommandHandler, CommandResult, FnHandler, HandlerContext};
pub use parser::{canonical_diff, parse_line, parse_macro, Macro, ParseError, ParsedCommand, VersionInfo};
pub use runner::{MacroCaseResult, MacroRunner, RunConfig, RunResult, RunnerBuilder};
pub use session::{ExecutionState, RunStatus, Session, Transcript};
pub use value::{format_number, parse_number, Value};
pub use vars::{DatasourceView, Scope, VariableStore, EXTRACT_SEPARATOR, MIRRORED_COLUMNS};

// Convenience functions for cargo test integration
pub use runner::{run, run_and_assert, run_and_assert_with};
