//! `{{...}}` interpolation
//!
//! A token whose body is a plain variable name is a direct lookup;
//! anything else is handed to the expression evaluator. Tokens that
//! cannot be resolved stay in the text verbatim, so callers that need
//! strictness can look for a residual `{{`. The only failure is an abort
//! raised by an expression, which the caller must treat as fatal.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::MacroError;
use crate::expr::{self, Outcome, VariableSource};

/// Expand every `{{...}}` token in `text`.
pub fn expand(text: &str, vars: &dyn VariableSource) -> Result<String, MacroError> {
    if !text.contains("{{") {
        return Ok(text.to_string());
    }

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let mut copied = 0;

    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if let Some(end) = token_end(bytes, i + 2) {
                out.push_str(&text[copied..i]);
                let body = &text[i + 2..end];
                match resolve(body, vars)? {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&text[i..end + 2]),
                }
                i = end + 2;
                copied = i;
                continue;
            }
        }
        i += 1;
    }
    out.push_str(&text[copied..]);
    Ok(out)
}

/// Find the `}}` closing a token whose body starts at `start`, skipping
/// nested tokens and quoted strings. Returns the body's end offset.
fn token_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                depth += 1;
                i += 2;
                continue;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
                i += 2;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn resolve(body: &str, vars: &dyn VariableSource) -> Result<Option<String>, MacroError> {
    let trimmed = body.trim();
    if is_variable_name(trimmed) {
        return Ok(vars.lookup(trimmed).map(|v| v.into_text()));
    }
    match expr::evaluate(trimmed, vars) {
        Outcome::Value(v) => Ok(Some(v.into_text())),
        Outcome::Abort(msg) => Err(MacroError::aborted(msg)),
        Outcome::Error(e) => {
            debug!(expression = trimmed, error = %e, "expression left unexpanded");
            Ok(None)
        }
    }
}

/// `name`, `!NAME` or `!NOW:format`
pub fn is_variable_name(s: &str) -> bool {
    let head = match s.split_once(':') {
        Some((head, _)) if head.eq_ignore_ascii_case("!NOW") => head,
        Some(_) => return false,
        None => s,
    };
    let name = head.strip_prefix('!').unwrap_or(head);
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn legacy_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<(SP|BR|TAB)>").expect("marker pattern is valid"))
}

/// Decode the legacy whitespace markers `<SP>`, `<BR>` and `<TAB>`.
pub fn decode_legacy(text: &str) -> String {
    if !text.contains('<') {
        return text.to_string();
    }
    legacy_markers()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match caps[1].to_ascii_uppercase().as_str() {
                "SP" => " ",
                "BR" => "\n",
                _ => "\t",
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::vars::VariableStore;

    fn store() -> VariableStore {
        let mut vars = VariableStore::new();
        vars.set("!VAR1", "2").unwrap();
        vars.set("name", "Ada").unwrap();
        vars
    }

    #[test]
    fn test_direct_references() {
        let vars = store();
        assert_eq!(expand("x={{!VAR1}}", &vars).unwrap(), "x=2");
        assert_eq!(expand("Hi {{NAME}}!", &vars).unwrap(), "Hi Ada!");
        assert_eq!(expand("{{ !var1 }}", &vars).unwrap(), "2");
    }

    #[test]
    fn test_unresolved_left_verbatim() {
        let vars = store();
        assert_eq!(expand("a{{missing}}b", &vars).unwrap(), "a{{missing}}b");
        assert_eq!(expand("{{1 +}}", &vars).unwrap(), "{{1 +}}");
        assert_eq!(expand("open {{ only", &vars).unwrap(), "open {{ only");
    }

    #[test]
    fn test_expressions() {
        let vars = store();
        assert_eq!(expand("{{1+1}}", &vars).unwrap(), "2");
        assert_eq!(expand("{{!VAR1 * 10}}", &vars).unwrap(), "20");
        assert_eq!(expand(r#"{{concat("}}", "x")}}"#, &vars).unwrap(), "}}x");
        assert_eq!(expand("{{{{!VAR1}} + 1}}", &vars).unwrap(), "3");
    }

    #[test]
    fn test_abort_propagates() {
        let vars = store();
        let err = expand(r#"a {{abort("halt")}} b"#, &vars).unwrap_err();
        assert_eq!(err.code, ErrorCode::Aborted);
        assert!(err.message.contains("halt"));
    }

    #[test]
    fn test_variable_names() {
        assert!(is_variable_name("!VAR1"));
        assert!(is_variable_name("user_name"));
        assert!(is_variable_name("!NOW:yyyy-mm-dd"));
        assert!(!is_variable_name("1+1"));
        assert!(!is_variable_name("f(x)"));
        assert!(!is_variable_name("!LOOP:x"));
    }

    #[test]
    fn test_decode_legacy() {
        assert_eq!(decode_legacy("a<SP>b<br>c<TAB>d"), "a b\nc\td");
        assert_eq!(decode_legacy("<p>"), "<p>");
    }
}
