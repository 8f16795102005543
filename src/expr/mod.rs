//! Sandboxed expression evaluator
//!
//! Evaluates the small expression language found inside `{{...}}` markers
//! and `EVAL("...")` values: arithmetic, string and comparison operators,
//! `and`/`or`/`not`, the constants `PI` and `E`, and the fixed function
//! library in [`functions`]. Nothing here can reach host state: the only
//! names an expression sees are its bound `{{name}}` references and the
//! variables of the [`VariableSource`] it is evaluated against.
//!
//! An evaluation ends in one of three ways, see [`Outcome`].

mod functions;
mod lexer;
mod parser;

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::value::Value;
use parser::{BinOp, Expr, UnOp};

pub use functions::FUNCTIONS;

/// Longest expression source accepted
pub const MAX_SOURCE_LEN: usize = 10_000;

/// Deepest nesting accepted, counting parentheses, call arguments,
/// prefix operators and operator chains
const MAX_DEPTH: usize = 128;

/// Where unbound names are looked up
pub trait VariableSource {
    fn lookup(&self, name: &str) -> Option<Value>;
}

/// A source with no variables at all
impl VariableSource for () {
    fn lookup(&self, _name: &str) -> Option<Value> {
        None
    }
}

impl VariableSource for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown function {0}")]
    UnknownFunction(String),
    #[error("{function} expects {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },
    #[error("{function}: cannot convert {input:?} to a number")]
    Conversion { function: String, input: String },
    #[error("{0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("forbidden construct: {0}")]
    Forbidden(String),
    #[error("expression is {len} characters long, limit is {max}")]
    TooLong { len: usize, max: usize },
}

/// Result of one evaluation.
///
/// `Abort` is raised by the `abort`/`macroerror` functions. It is not an
/// error: callers must stop the run rather than retry or ignore it.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Value(Value),
    Error(EvalError),
    Abort(String),
}

impl Outcome {
    pub fn is_abort(&self) -> bool {
        matches!(self, Outcome::Abort(_))
    }

    pub fn value(self) -> Option<Value> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Ways an evaluation can be cut short
#[derive(Debug)]
pub(crate) enum Interrupt {
    Error(EvalError),
    Abort(String),
}

impl From<EvalError> for Interrupt {
    fn from(e: EvalError) -> Self {
        Interrupt::Error(e)
    }
}

fn denylist() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\beval\s*\(|\bFunction\s*\(|\bprocess\s*\.|\bwindow\b|\bglobalThis\b|\brequire\s*\(|\bimport\s*\(|\bconstructor\b|__proto__|\bprototype\b",
        )
        .expect("denylist pattern is valid")
    })
}

fn reference() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*(!?[A-Za-z_][A-Za-z0-9_]*(?::[^{}]*)?)\s*\}\}")
            .expect("reference pattern is valid")
    })
}

/// Evaluate `src` against `vars`.
pub fn evaluate(src: &str, vars: &dyn VariableSource) -> Outcome {
    match evaluate_inner(src, vars) {
        Ok(v) => Outcome::Value(v),
        Err(Interrupt::Error(e)) => Outcome::Error(e),
        Err(Interrupt::Abort(msg)) => Outcome::Abort(msg),
    }
}

fn evaluate_inner(src: &str, vars: &dyn VariableSource) -> Result<Value, Interrupt> {
    if src.len() > MAX_SOURCE_LEN {
        return Err(EvalError::TooLong {
            len: src.len(),
            max: MAX_SOURCE_LEN,
        }
        .into());
    }
    if let Some(m) = denylist().find(src) {
        return Err(EvalError::Forbidden(m.as_str().trim().to_string()).into());
    }

    // {{name}} references become fresh identifiers bound to their values
    let mut bindings: HashMap<String, Value> = HashMap::new();
    let source = reference().replace_all(src, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        let ident = binding_name(name, bindings.len());
        let value = vars.lookup(name).unwrap_or_else(|| Value::Str(String::new()));
        bindings.insert(ident.clone(), value);
        ident
    });

    let tokens = lexer::tokenize(&source)?;
    let ast = parser::parse(tokens)?;
    Evaluator {
        bindings: &bindings,
        vars,
    }
    .eval(&ast)
}

/// Identifier a `{{name}}` reference is bound to. System names start
/// with `!`, which the prefix turns into a plain identifier.
fn binding_name(name: &str, n: usize) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.starts_with('!') {
        format!("__sys{}_{}", n, sanitized.trim_start_matches('_'))
    } else {
        format!("__var{}_{}", n, sanitized)
    }
}

struct Evaluator<'a> {
    bindings: &'a HashMap<String, Value>,
    vars: &'a dyn VariableSource,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, Interrupt> {
        match expr {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Var(name) => Ok(self
                .bindings
                .get(name)
                .cloned()
                .or_else(|| self.vars.lookup(name))
                .unwrap_or_else(|| Value::Str(String::new()))),
            Expr::Unary(UnOp::Neg, operand) => {
                let v = self.eval(operand)?;
                Ok(Value::Num(-number("-", &v)?))
            }
            Expr::Unary(UnOp::Not, operand) => Ok(Value::Bool(!self.eval(operand)?.truthy())),
            Expr::Binary(BinOp::And, lhs, rhs) => {
                if !self.eval(lhs)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(rhs)?.truthy()))
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                if self.eval(lhs)?.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(rhs)?.truthy()))
            }
            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                Ok(binary(*op, a, b)?)
            }
            Expr::Call(name, args) if name.eq_ignore_ascii_case("iif") => {
                if args.len() != 3 {
                    return Err(EvalError::Arity {
                        function: "iif".into(),
                        expected: "3".into(),
                        got: args.len(),
                    }
                    .into());
                }
                let branch = if self.eval(&args[0])?.truthy() { &args[1] } else { &args[2] };
                self.eval(branch)
            }
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                functions::call(name, values)
            }
        }
    }
}

fn number(op: &str, v: &Value) -> Result<f64, EvalError> {
    v.as_number().ok_or_else(|| {
        EvalError::Type(format!("operator {} expects a number, got {:?}", op, v.to_string()))
    })
}

fn binary(op: BinOp, a: Value, b: Value) -> Result<Value, EvalError> {
    let both_numeric = a.is_numeric() && b.is_numeric();
    let v = match op {
        BinOp::Add => {
            if both_numeric {
                Value::Num(number("+", &a)? + number("+", &b)?)
            } else {
                Value::Str(a.into_text() + &b.into_text())
            }
        }
        BinOp::Sub => Value::Num(number("-", &a)? - number("-", &b)?),
        BinOp::Mul => Value::Num(number("*", &a)? * number("*", &b)?),
        BinOp::Div => {
            let d = number("/", &b)?;
            if d == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Value::Num(number("/", &a)? / d)
        }
        BinOp::Rem => {
            let d = number("%", &b)?;
            if d == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Value::Num(number("%", &a)? % d)
        }
        BinOp::Pow => Value::Num(number("^", &a)?.powf(number("^", &b)?)),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = if both_numeric {
                let (x, y) = (number("", &a)?, number("", &b)?);
                x.partial_cmp(&y)
            } else {
                Some(a.to_string().cmp(&b.to_string()))
            };
            let result = match (op, ord) {
                (BinOp::Ne, None) => true,
                (_, None) => false,
                (BinOp::Eq, Some(o)) => o.is_eq(),
                (BinOp::Ne, Some(o)) => o.is_ne(),
                (BinOp::Lt, Some(o)) => o.is_lt(),
                (BinOp::Le, Some(o)) => o.is_le(),
                (BinOp::Gt, Some(o)) => o.is_gt(),
                (_, Some(o)) => o.is_ge(),
            };
            Value::Bool(result)
        }
        BinOp::And => Value::Bool(a.truthy() && b.truthy()),
        BinOp::Or => Value::Bool(a.truthy() || b.truthy()),
    };
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Outcome {
        evaluate(src, &())
    }

    fn value(src: &str) -> Value {
        match eval(src) {
            Outcome::Value(v) => v,
            other => panic!("{} did not evaluate: {:?}", src, other),
        }
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(value("2 + 3 * 4"), Value::Num(14.0));
        assert_eq!(value("(2 + 3) * 4"), Value::Num(20.0));
        assert_eq!(value("2 ^ 3 ^ 2"), Value::Num(512.0));
        assert_eq!(value("-2 ^ 2"), Value::Num(-4.0));
        assert_eq!(value("7 % 4"), Value::Num(3.0));
        assert_eq!(value("1+1").to_string(), "2");
    }

    #[test]
    fn test_strings_and_functions() {
        assert_eq!(value(r#"concat("a","b")"#), Value::from("ab"));
        assert_eq!(value(r#"iif(5>3,"x","y")"#), Value::from("x"));
        assert_eq!(value(r#""a" + 1"#), Value::from("a1"));
        assert_eq!(value(r#""2" + 3"#), Value::Num(5.0));
        assert_eq!(value("round(PI * 100) / 100"), Value::Num(3.14));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(value("1 = 1"), Value::Bool(true));
        assert_eq!(value("1 == 2"), Value::Bool(false));
        assert_eq!(value(r#""abc" < "abd""#), Value::Bool(true));
        assert_eq!(value("10 > 9"), Value::Bool(true));
        assert_eq!(value("1 < 2 and not 3 < 2"), Value::Bool(true));
        assert_eq!(value("0 or 0"), Value::Bool(false));
    }

    #[test]
    fn test_iif_is_lazy() {
        assert_eq!(value(r#"iif(1, "ok", abort("no"))"#), Value::from("ok"));
        assert!(eval(r#"iif(0, "ok", abort("no"))"#).is_abort());
    }

    #[test]
    fn test_references_bind_to_values() {
        let mut vars = HashMap::new();
        vars.insert("!VAR1".to_string(), Value::from("3"));
        vars.insert("name".to_string(), Value::from("bob"));
        assert_eq!(
            evaluate("{{!VAR1}} * 2", &vars),
            Outcome::Value(Value::Num(6.0))
        );
        assert_eq!(
            evaluate(r#"upper({{name}})"#, &vars),
            Outcome::Value(Value::from("BOB"))
        );
        // unresolved references and bare names are empty
        assert_eq!(
            evaluate(r#"concat({{missing}}, nothing, "x")"#, &vars),
            Outcome::Value(Value::from("x"))
        );
    }

    #[test]
    fn test_host_access_is_rejected() {
        for src in [
            "eval('1')",
            "Function('return 1')()",
            "process.exit(1)",
            "window",
            "globalThis",
            "require('fs')",
            "import('x')",
            "a.constructor",
            "x.__proto__",
            "foo.bar",
        ] {
            assert!(
                matches!(eval(src), Outcome::Error(EvalError::Forbidden(_))),
                "{} was not rejected",
                src
            );
        }
    }

    #[test]
    fn test_errors_are_typed() {
        assert_eq!(eval("1 / 0"), Outcome::Error(EvalError::DivisionByZero));
        assert!(matches!(eval("1 +"), Outcome::Error(EvalError::Syntax(_))));
        assert!(matches!(
            eval("num('abc')"),
            Outcome::Error(EvalError::Conversion { .. })
        ));
        assert!(matches!(
            eval("nosuch(1)"),
            Outcome::Error(EvalError::UnknownFunction(_))
        ));
        let long = "1+".repeat(MAX_SOURCE_LEN) + "1";
        assert!(matches!(eval(&long), Outcome::Error(EvalError::TooLong { .. })));
        let deep = "(".repeat(200) + "1" + &")".repeat(200);
        assert!(matches!(eval(&deep), Outcome::Error(EvalError::Syntax(_))));
    }

    #[test]
    fn test_deep_prefix_operators_are_errors() {
        for src in [
            format!("{}1", "-".repeat(9000)),
            format!("{}1", "!".repeat(9000)),
            format!("{}1", "not ".repeat(2000)),
            format!("2{}", "^2".repeat(3000)),
        ] {
            assert!(src.len() <= MAX_SOURCE_LEN);
            assert!(
                matches!(eval(&src), Outcome::Error(EvalError::Syntax(_))),
                "{}... was accepted",
                &src[..8]
            );
        }
        assert_eq!(eval("--1"), Outcome::Value(Value::Num(1.0)));
    }

    #[test]
    fn test_substr_with_huge_bounds() {
        assert_eq!(
            eval(r#"substr("abc", 1, 1e19)"#),
            Outcome::Value(Value::Str("bc".into()))
        );
        assert_eq!(
            eval(r#"substr("abc", -1e30, 2)"#),
            Outcome::Value(Value::Str("ab".into()))
        );
    }

    #[test]
    fn test_abort_is_distinct_outcome() {
        assert_eq!(
            eval(r#"abort("done here")"#),
            Outcome::Abort("done here".into())
        );
        assert_eq!(value("2 + 2").to_string(), "4");
    }
}
