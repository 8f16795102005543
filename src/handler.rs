//! Capability handlers
//!
//! The interpreter performs no browser, file or image work itself. The
//! host registers one [`CommandHandler`] per command kind; the engine calls
//! it with a [`HandlerContext`] and reads back a [`CommandResult`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::command::{Action, CommandKind, Params};
use crate::error::{ErrorCode, MacroError};
use crate::session::Transcript;
use crate::vars::VariableStore;

/// Outcome of one handler invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    /// Text produced by the command (extracted content for extracting commands)
    pub output: Option<String>,
    /// Host-specific structured data, passed through untouched
    pub side_effects: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_code: ErrorCode::Ok,
            error_message: None,
            output: None,
            side_effects: None,
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: code,
            error_message: Some(message.into()),
            output: None,
            side_effects: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_side_effects(mut self, data: serde_json::Value) -> Self {
        self.side_effects = Some(data);
        self
    }

    /// Whether the engine may retry this failure.
    pub fn is_retryable(&self) -> bool {
        !self.success && self.error_code.is_retryable()
    }

    /// The failure as a `MacroError`, if this result is one.
    pub fn to_error(&self) -> Option<MacroError> {
        if self.success {
            return None;
        }
        let code = if self.error_code == ErrorCode::Ok {
            ErrorCode::ExecutionError
        } else {
            self.error_code
        };
        let message = self
            .error_message
            .clone()
            .unwrap_or_else(|| code.name().to_string());
        Some(MacroError::new(code, message))
    }
}

impl From<MacroError> for CommandResult {
    fn from(e: MacroError) -> Self {
        CommandResult::failure(e.code, e.message)
    }
}

/// What a handler sees of the run
pub struct HandlerContext<'a> {
    pub kind: CommandKind,
    /// The validated, typed command
    pub action: &'a Action,
    /// 1-based source line
    pub line: usize,
    /// 1-based attempt number within the retry loop
    pub attempt: u32,
    /// Timeout that applies to this command's class
    pub timeout: Duration,
    params: &'a Params,
    vars: &'a mut VariableStore,
    log: &'a mut Transcript,
}

impl<'a> HandlerContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind: CommandKind,
        action: &'a Action,
        params: &'a Params,
        line: usize,
        attempt: u32,
        timeout: Duration,
        vars: &'a mut VariableStore,
        log: &'a mut Transcript,
    ) -> Self {
        Self {
            kind,
            action,
            line,
            attempt,
            timeout,
            params,
            vars,
            log,
        }
    }

    /// Expanded parameter value
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub fn params(&self) -> &Params {
        self.params
    }

    pub fn vars(&self) -> &VariableStore {
        self.vars
    }

    pub fn vars_mut(&mut self) -> &mut VariableStore {
        self.vars
    }

    /// Expand `{{...}}` references against the run's variables.
    pub fn expand(&self, text: &str) -> Result<String, MacroError> {
        crate::expand::expand(text, &*self.vars)
    }

    /// Write to the run transcript.
    pub fn log(&mut self, msg: &str) {
        info!(line = self.line, command = %self.kind, "{}", msg);
        self.log.logf(msg);
    }
}

/// A host capability for one command kind
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &mut HandlerContext<'_>) -> CommandResult;
}

/// A boxed handler
pub type BoxedHandler = Box<dyn CommandHandler>;

/// Adapts a synchronous closure into a [`CommandHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&mut HandlerContext<'_>) -> CommandResult + Send + Sync,
{
    async fn handle(&self, ctx: &mut HandlerContext<'_>) -> CommandResult {
        (self.0)(ctx)
    }
}

/// Box a closure as a handler.
pub fn handler_fn<F>(f: F) -> BoxedHandler
where
    F: Fn(&mut HandlerContext<'_>) -> CommandResult + Send + Sync + 'static,
{
    Box::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_constructors() {
        let ok = CommandResult::ok().with_output("text");
        assert!(ok.success);
        assert_eq!(ok.output.as_deref(), Some("text"));
        assert!(ok.to_error().is_none());

        let miss = CommandResult::failure(ErrorCode::ElementNotFound, "no such element");
        assert!(miss.is_retryable());
        let err = miss.to_error().unwrap();
        assert_eq!(err.code.code(), -920);

        let disabled = CommandResult::failure(ErrorCode::ElementNotEnabled, "disabled");
        assert!(!disabled.is_retryable());
    }

    #[test]
    fn test_failure_without_code_is_execution_error() {
        let mut r = CommandResult::ok();
        r.success = false;
        assert_eq!(r.to_error().unwrap().code, ErrorCode::ExecutionError);
    }

    #[tokio::test]
    async fn test_fn_handler_sees_context() {
        let handler = handler_fn(|ctx| {
            let target = ctx.param("GOTO").unwrap_or_default().to_string();
            ctx.vars_mut().set("!URLCURRENT", target.clone()).ok();
            ctx.log(&format!("navigate {}", target));
            CommandResult::ok()
        });

        let mut params = Params::new();
        params.insert(crate::command::Param {
            key: "GOTO".into(),
            value: "https://example.com".into(),
            quoted: false,
            positional: false,
        });
        let action = Action::from_params(CommandKind::Url, &params).unwrap();
        let mut vars = VariableStore::new();
        let mut log = Transcript::default();
        let mut ctx = HandlerContext::new(
            CommandKind::Url,
            &action,
            &params,
            1,
            1,
            Duration::from_secs(60),
            &mut vars,
            &mut log,
        );
        let result = handler.handle(&mut ctx).await;
        assert!(result.success);
        assert_eq!(vars.get_text("!URLCURRENT"), "https://example.com");
        assert!(log.as_str().contains("navigate https://example.com"));
    }
}
