//! Built-in expression functions
//!
//! Every function here is pure apart from `random`. Names match
//! case-insensitively. `iif` is not listed: the evaluator handles it so
//! that only the chosen branch is evaluated.

use rand::Rng;

use super::{EvalError, Interrupt};
use crate::value::{parse_number, Value};

/// Names callable from expressions, lower-cased
pub const FUNCTIONS: &[&str] = &[
    "concat", "length", "substr", "substring", "upper", "lower", "trim", "indexof", "replace",
    "charat", "splitget", "abs", "ceil", "floor", "round", "min", "max", "pow", "sqrt", "log",
    "exp", "sin", "cos", "tan", "random", "str", "num", "int", "float", "iif", "abort",
    "macroerror",
];

pub(super) fn call(name: &str, args: Vec<Value>) -> Result<Value, Interrupt> {
    let lname = name.to_ascii_lowercase();
    let f = lname.as_str();
    let v = match f {
        // ── strings ─────────────────────────────────────────
        "concat" => Value::Str(args.into_iter().map(Value::into_text).collect()),
        "length" => {
            let [s] = fixed::<1>(f, args)?;
            Value::Num(s.to_string().chars().count() as f64)
        }
        "upper" => {
            let [s] = fixed::<1>(f, args)?;
            Value::Str(s.to_string().to_uppercase())
        }
        "lower" => {
            let [s] = fixed::<1>(f, args)?;
            Value::Str(s.to_string().to_lowercase())
        }
        "trim" => {
            let [s] = fixed::<1>(f, args)?;
            Value::Str(s.to_string().trim().to_string())
        }
        "substr" => {
            arity(f, &args, 2, 3)?;
            let chars: Vec<char> = args[0].to_string().chars().collect();
            let len = chars.len() as i64;
            let mut start = int_arg(f, &args[1])?;
            if start < 0 {
                start = len.saturating_add(start).max(0);
            }
            let start = start.min(len);
            let count = match args.get(2) {
                Some(c) => int_arg(f, c)?.max(0),
                None => len - start,
            };
            let end = start.saturating_add(count).min(len);
            Value::Str(chars[start as usize..end as usize].iter().collect())
        }
        "substring" => {
            arity(f, &args, 2, 3)?;
            let chars: Vec<char> = args[0].to_string().chars().collect();
            let len = chars.len() as i64;
            let a = int_arg(f, &args[1])?.clamp(0, len);
            let b = match args.get(2) {
                Some(e) => int_arg(f, e)?.clamp(0, len),
                None => len,
            };
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            Value::Str(chars[lo as usize..hi as usize].iter().collect())
        }
        "indexof" => {
            arity(f, &args, 2, 3)?;
            let hay: Vec<char> = args[0].to_string().chars().collect();
            let needle: Vec<char> = args[1].to_string().chars().collect();
            let from = match args.get(2) {
                Some(v) => int_arg(f, v)?.max(0) as usize,
                None => 0,
            };
            Value::Num(find_chars(&hay, &needle, from).map_or(-1.0, |i| i as f64))
        }
        "replace" => {
            let [s, from, to] = fixed::<3>(f, args)?;
            let (s, from, to) = (s.into_text(), from.into_text(), to.into_text());
            if from.is_empty() {
                Value::Str(s)
            } else {
                Value::Str(s.replace(&from, &to))
            }
        }
        "charat" => {
            let [s, i] = fixed::<2>(f, args)?;
            let i = int_arg(f, &i)?;
            let c = if i < 0 {
                None
            } else {
                s.to_string().chars().nth(i as usize)
            };
            Value::Str(c.map(String::from).unwrap_or_default())
        }
        "splitget" => {
            let [s, sep, i] = fixed::<3>(f, args)?;
            let (s, sep) = (s.into_text(), sep.into_text());
            let i = int_arg(f, &i)?;
            let part = if i < 0 {
                None
            } else if sep.is_empty() {
                s.chars().nth(i as usize).map(String::from)
            } else {
                s.split(sep.as_str()).nth(i as usize).map(String::from)
            };
            Value::Str(part.unwrap_or_default())
        }

        // ── numbers ─────────────────────────────────────────
        "abs" => unary_num(f, args, f64::abs)?,
        "ceil" => unary_num(f, args, f64::ceil)?,
        "floor" => unary_num(f, args, f64::floor)?,
        "sqrt" => unary_num(f, args, f64::sqrt)?,
        "log" => unary_num(f, args, f64::ln)?,
        "exp" => unary_num(f, args, f64::exp)?,
        "sin" => unary_num(f, args, f64::sin)?,
        "cos" => unary_num(f, args, f64::cos)?,
        "tan" => unary_num(f, args, f64::tan)?,
        "round" => {
            arity(f, &args, 1, 2)?;
            let x = num_arg(f, &args[0])?;
            let digits = match args.get(1) {
                Some(d) => int_arg(f, d)?,
                None => 0,
            };
            let scale = 10f64.powi(digits as i32);
            Value::Num((x * scale + 0.5).floor() / scale)
        }
        "min" | "max" => {
            if args.is_empty() {
                return Err(EvalError::Arity {
                    function: f.to_string(),
                    expected: "at least 1".into(),
                    got: 0,
                }
                .into());
            }
            let mut nums = Vec::with_capacity(args.len());
            for a in &args {
                nums.push(num_arg(f, a)?);
            }
            let pick = if f == "min" { f64::min } else { f64::max };
            Value::Num(nums.into_iter().reduce(pick).unwrap_or(f64::NAN))
        }
        "pow" => {
            let [a, b] = fixed::<2>(f, args)?;
            Value::Num(num_arg(f, &a)?.powf(num_arg(f, &b)?))
        }
        "random" => {
            arity(f, &args, 0, 2)?;
            let mut rng = rand::thread_rng();
            match args.len() {
                0 => Value::Num(rng.gen::<f64>()),
                1 => {
                    let max = int_arg(f, &args[0])?;
                    if max <= 0 {
                        Value::Num(0.0)
                    } else {
                        Value::Num(rng.gen_range(0..max) as f64)
                    }
                }
                _ => {
                    let lo = int_arg(f, &args[0])?;
                    let hi = int_arg(f, &args[1])?;
                    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                    Value::Num(rng.gen_range(lo..=hi) as f64)
                }
            }
        }

        // ── conversions ─────────────────────────────────────
        "str" => {
            let [v] = fixed::<1>(f, args)?;
            Value::Str(v.into_text())
        }
        "num" | "float" => {
            let [v] = fixed::<1>(f, args)?;
            Value::Num(convert(f, &v)?)
        }
        "int" => {
            let [v] = fixed::<1>(f, args)?;
            Value::Num(convert(f, &v)?.trunc())
        }

        // ── control ─────────────────────────────────────────
        "abort" | "macroerror" => {
            let msg = args
                .into_iter()
                .next()
                .map(Value::into_text)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "aborted".to_string());
            return Err(Interrupt::Abort(msg));
        }
        _ => return Err(EvalError::UnknownFunction(name.to_string()).into()),
    };
    Ok(v)
}

fn arity(f: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(EvalError::Arity {
            function: f.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn fixed<const N: usize>(f: &str, args: Vec<Value>) -> Result<[Value; N], EvalError> {
    let got = args.len();
    args.try_into().map_err(|_| EvalError::Arity {
        function: f.to_string(),
        expected: N.to_string(),
        got,
    })
}

fn num_arg(f: &str, v: &Value) -> Result<f64, EvalError> {
    v.as_number().ok_or_else(|| {
        EvalError::Type(format!("{} expects a number, got {:?}", f, v.to_string()))
    })
}

fn int_arg(f: &str, v: &Value) -> Result<i64, EvalError> {
    Ok(num_arg(f, v)?.trunc() as i64)
}

fn unary_num(f: &str, args: Vec<Value>, op: fn(f64) -> f64) -> Result<Value, EvalError> {
    let [x] = fixed::<1>(f, args)?;
    Ok(Value::Num(op(num_arg(f, &x)?)))
}

fn convert(f: &str, v: &Value) -> Result<f64, EvalError> {
    match v {
        Value::Num(n) => Ok(*n),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Str(s) => parse_number(s).ok_or_else(|| EvalError::Conversion {
            function: f.to_string(),
            input: s.clone(),
        }),
    }
}

fn find_chars(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(hay.len()));
    }
    if needle.len() > hay.len() {
        return None;
    }
    (from..=hay.len() - needle.len()).find(|&i| hay[i..i + needle.len()] == *needle)
}
