//! Variable commands: SET, ADD, CMDLINE

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{mismatch, Builtin, BuiltinEnv, BuiltinUsage, Flow};
use crate::command::{Action, CommandKind};
use crate::config::ReplaySpeed;
use crate::error::{ErrorCode, MacroError};
use crate::expr::{self, Outcome};
use crate::value::{format_number, parse_number};
use crate::vars::VariableStore;

// ──────────────────────────────────────────────────────────
// SET: assign a variable
// ──────────────────────────────────────────────────────────

pub(super) struct SetCmd;

#[async_trait]
impl Builtin for SetCmd {
    async fn run(&self, env: &mut BuiltinEnv<'_>, action: &Action) -> Result<Flow, MacroError> {
        let Action::Set { var, value } = action else {
            return Err(mismatch(CommandKind::Set, action));
        };

        let value = match eval_argument(value) {
            Some(src) => evaluate(&src, &env.session.vars)?,
            None => value.clone(),
        };
        debug!(var = %var, value = %value, "SET");

        let key = var.trim().to_ascii_uppercase();
        match key.as_str() {
            "!DATASOURCE" => super::data::load(env, &value).await?,
            "!DATASOURCE_LINE" => super::data::goto_line(env.session, &value)?,
            _ => assign(&mut env.session.vars, var, &key, value)?,
        }
        Ok(Flow::Continue)
    }

    fn usage(&self) -> BuiltinUsage {
        BuiltinUsage {
            summary: "Assign a variable; EVAL(\"expr\") evaluates an expression",
            args: "var value",
        }
    }
}

/// Store a SET value, validating the system settings that have a fixed
/// value space.
fn assign(vars: &mut VariableStore, var: &str, key: &str, value: String) -> Result<(), MacroError> {
    match key {
        "!TIMEOUT" => {
            let secs = seconds_value(key, &value)?;
            vars.set("!TIMEOUT", format_number(secs))?;
            vars.set("!TIMEOUT_PAGE", format_number(secs))?;
            vars.set("!TIMEOUT_STEP", format_number(secs / 10.0))
        }
        "!TIMEOUT_STEP" | "!TIMEOUT_PAGE" | "!TIMEOUT_TAG" => {
            let secs = seconds_value(key, &value)?;
            vars.set(key, format_number(secs))
        }
        "!REPLAYSPEED" => {
            if ReplaySpeed::from_setting(&value).is_none() {
                return Err(MacroError::invalid(key, &value, "FAST, MEDIUM or SLOW"));
            }
            vars.set(key, value.trim().to_ascii_uppercase())
        }
        "!ERRORIGNORE" => {
            let flag = match value.trim().to_ascii_uppercase().as_str() {
                "YES" | "TRUE" => "YES",
                "NO" | "FALSE" => "NO",
                _ => return Err(MacroError::invalid(key, &value, "YES or NO")),
            };
            vars.set(key, flag)
        }
        _ => vars.set(var, value),
    }
}

fn eval_call() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^\s*EVAL\s*\((.*)\)\s*$").expect("EVAL pattern is valid"))
}

/// The expression inside `EVAL("...")`, with its quotes removed.
fn eval_argument(value: &str) -> Option<String> {
    let caps = eval_call().captures(value)?;
    let inner = caps.get(1)?.as_str().trim();
    let mut chars = inner.chars();
    let first = chars.next();
    let last = chars.next_back();
    match (first, last) {
        (Some(q @ ('"' | '\'')), Some(l)) if l == q => {
            let body = &inner[1..inner.len() - 1];
            let escaped_quote = format!("\\{}", q);
            Some(body.replace(&escaped_quote, &q.to_string()).replace("\\\\", "\\"))
        }
        _ => Some(inner.to_string()),
    }
}

fn evaluate(src: &str, vars: &VariableStore) -> Result<String, MacroError> {
    match expr::evaluate(src, vars) {
        Outcome::Value(v) => Ok(v.into_text()),
        Outcome::Error(e) => Err(MacroError::from(e)),
        Outcome::Abort(msg) => Err(MacroError::aborted(msg)),
    }
}

fn seconds_value(key: &str, value: &str) -> Result<f64, MacroError> {
    parse_number(value)
        .filter(|s| *s >= 0.0)
        .ok_or_else(|| MacroError::invalid(key, value, "a non-negative number of seconds"))
}

// ──────────────────────────────────────────────────────────
// ADD: numeric add or text append
// ──────────────────────────────────────────────────────────

pub(super) struct AddCmd;

#[async_trait]
impl Builtin for AddCmd {
    async fn run(&self, env: &mut BuiltinEnv<'_>, action: &Action) -> Result<Flow, MacroError> {
        let Action::Add { var, value } = action else {
            return Err(mismatch(CommandKind::Add, action));
        };
        let vars = &mut env.session.vars;
        if var.trim().eq_ignore_ascii_case("!EXTRACT") {
            vars.add_extract(value.clone());
            return Ok(Flow::Continue);
        }
        match parse_number(value) {
            Some(delta) => vars.add(var, delta)?,
            None => vars.append(var, value)?,
        }
        Ok(Flow::Continue)
    }

    fn usage(&self) -> BuiltinUsage {
        BuiltinUsage {
            summary: "Add a number to a variable, or append text",
            args: "var value",
        }
    }
}

// ──────────────────────────────────────────────────────────
// CMDLINE: take a variable's value from the host
// ──────────────────────────────────────────────────────────

pub(super) struct CmdlineCmd;

#[async_trait]
impl Builtin for CmdlineCmd {
    async fn run(&self, env: &mut BuiltinEnv<'_>, action: &Action) -> Result<Flow, MacroError> {
        let Action::Cmdline { var, default } = action else {
            return Err(mismatch(CommandKind::Cmdline, action));
        };
        let value = env
            .config
            .cmdline_value(var)
            .map(str::to_string)
            .or_else(|| default.clone())
            .ok_or_else(|| {
                MacroError::new(
                    ErrorCode::MissingParameter,
                    format!("no command-line value for {}", var),
                )
            })?;
        env.session.vars.set(var, value)?;
        Ok(Flow::Continue)
    }

    fn usage(&self) -> BuiltinUsage {
        BuiltinUsage {
            summary: "Set a variable from a host-supplied value",
            args: "var [default]",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;

    #[tokio::test]
    async fn test_set_plain_and_eval() {
        let mut h = Harness::new();
        h.run("SET !VAR1 hello").await.unwrap();
        assert_eq!(h.session.vars.get_text("!VAR1"), "hello");

        h.run(r#"SET total EVAL("2 + 3 * 4")"#).await.unwrap();
        assert_eq!(h.session.vars.get_text("TOTAL"), "14");

        h.run(r#"SET !VAR2 EVAL("{{!VAR1}}")"#).await.unwrap();
        assert_eq!(h.session.vars.get_text("!VAR2"), "hello");
    }

    #[tokio::test]
    async fn test_set_eval_abort_and_error() {
        let mut h = Harness::new();
        let err = h.run(r#"SET !VAR1 EVAL("abort('bye')")"#).await.unwrap_err();
        assert!(err.is_abort());
        let err = h.run(r#"SET !VAR1 EVAL("1 / 0")"#).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ExpressionError);
    }

    #[tokio::test]
    async fn test_timeout_sets_page_and_step() {
        let mut h = Harness::new();
        h.run("SET !TIMEOUT 30").await.unwrap();
        assert_eq!(h.session.vars.seconds("!TIMEOUT_PAGE"), Some(30.0));
        assert_eq!(h.session.vars.seconds("!TIMEOUT_STEP"), Some(3.0));

        let err = h.run("SET !TIMEOUT_STEP soon").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }

    #[tokio::test]
    async fn test_set_settings_are_validated() {
        let mut h = Harness::new();
        h.run("SET !ERRORIGNORE yes").await.unwrap();
        assert!(h.session.vars.error_ignore());
        assert!(h.run("SET !ERRORIGNORE maybe").await.is_err());
        h.run("SET !REPLAYSPEED slow").await.unwrap();
        assert_eq!(h.session.vars.get_text("!REPLAYSPEED"), "SLOW");
        assert!(h.run("SET !REPLAYSPEED warp").await.is_err());
        let err = h.run("SET !LOOP 5").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }

    #[tokio::test]
    async fn test_add_number_text_and_extract() {
        let mut h = Harness::new();
        h.run("ADD count 2").await.unwrap();
        h.run("ADD count 3").await.unwrap();
        assert_eq!(h.session.vars.get_text("COUNT"), "5");

        h.run("SET !VAR1 ab").await.unwrap();
        h.run("ADD !VAR1 cd").await.unwrap();
        assert_eq!(h.session.vars.get_text("!VAR1"), "abcd");

        h.run("ADD !EXTRACT 1").await.unwrap();
        h.run("ADD !EXTRACT two").await.unwrap();
        assert_eq!(h.session.vars.get_text("!EXTRACT"), "1[EXTRACT]two");
    }

    #[tokio::test]
    async fn test_cmdline_prefers_host_value() {
        let mut h = Harness::new();
        h.config.cmdline.insert("!VAR3".into(), "from-host".into());
        h.run("CMDLINE !VAR3 fallback").await.unwrap();
        assert_eq!(h.session.vars.get_text("!VAR3"), "from-host");

        h.run("CMDLINE !VAR4 fallback").await.unwrap();
        assert_eq!(h.session.vars.get_text("!VAR4"), "fallback");

        let err = h.run("CMDLINE !VAR5").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingParameter);
    }

    #[test]
    fn test_eval_argument() {
        assert_eq!(eval_argument(r#"EVAL("1+1")"#).as_deref(), Some("1+1"));
        assert_eq!(eval_argument("eval('a\\'b')").as_deref(), Some("a'b"));
        assert_eq!(eval_argument("EVAL(2*3)").as_deref(), Some("2*3"));
        assert_eq!(eval_argument("EVALUATE"), None);
        assert_eq!(eval_argument("x EVAL(1)"), None);
    }
}
