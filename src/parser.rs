//! Macro source parser
//!
//! Parses macro lines of the form `COMMAND KEY=value KEY="quoted value"`:
//! - a line whose first non-blank character is `'` is a comment
//! - keywords are case-insensitive
//! - double-quoted values support `\"`, `\\`, `\n` and `\t`
//! - unquoted values end at whitespace, except inside `{{...}}` or a quoted span
//! - `VERSION BUILD=... RECORDER=...` is metadata, not a command
//!
//! Values are kept raw. `{{...}}` expansion happens in the engine, at the
//! moment each command runs.

use crate::command::{CommandKind, Param, ParamLayout, Params};

/// A parsed macro line
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    /// 1-based line number in the macro source
    pub line_number: usize,
    pub kind: CommandKind,
    /// Raw, unexpanded parameters in source order
    pub params: Params,
    /// Original line text (for transcripts and error messages)
    pub raw: String,
}

/// `VERSION` line metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub build: Option<String>,
    pub recorder: Option<String>,
}

/// A parsed macro, ready to play
#[derive(Debug, Clone)]
pub struct Macro {
    pub source: String,
    pub commands: Vec<ParsedCommand>,
    pub version: Option<VersionInfo>,
}

/// Parse error returned when a line has invalid syntax
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

/// Parse a whole macro. The first malformed line fails the whole parse.
pub fn parse_macro(source: &str) -> Result<Macro, ParseError> {
    let mut commands = Vec::new();
    let mut version = None;

    for (i, line) in source.lines().enumerate() {
        let line_number = i + 1;
        let tokens = tokenize(line, line_number)?;
        let Some((keyword, rest)) = tokens.split_first() else {
            continue;
        };

        if keyword.eq_ignore_ascii_case("VERSION") {
            version = Some(parse_version(rest, line_number)?);
            continue;
        }

        commands.push(build_command(keyword, rest, line, line_number)?);
    }

    Ok(Macro {
        source: source.to_string(),
        commands,
        version,
    })
}

/// Parse a single macro line.
///
/// Returns `Ok(None)` for blank lines, comments and `VERSION` lines.
pub fn parse_line(line: &str, line_number: usize) -> Result<Option<ParsedCommand>, ParseError> {
    let tokens = tokenize(line, line_number)?;
    match tokens.split_first() {
        None => Ok(None),
        Some((keyword, _)) if keyword.eq_ignore_ascii_case("VERSION") => Ok(None),
        Some((keyword, rest)) => build_command(keyword, rest, line, line_number).map(Some),
    }
}

fn build_command(
    keyword: &str,
    tokens: &[String],
    line: &str,
    line_number: usize,
) -> Result<ParsedCommand, ParseError> {
    let kind: CommandKind = keyword
        .parse()
        .map_err(|_| ParseError::new(line_number, format!("unknown command: {}", keyword)))?;

    let mut params = Params::new();
    let mut next_slot = 0;

    for token in tokens {
        match kind.layout() {
            ParamLayout::Positional(slots) => {
                let Some(slot) = slots.get(next_slot) else {
                    return Err(ParseError::new(
                        line_number,
                        format!("{}: unexpected argument {}", kind, token),
                    ));
                };
                next_slot += 1;
                let (value, quoted) = decode_value(token, line_number)?;
                params.insert(Param {
                    key: slot.to_string(),
                    value,
                    quoted,
                    positional: true,
                });
            }
            ParamLayout::Keyed(slots) => {
                if let Some((key, raw_value)) = split_key(token) {
                    let (value, quoted) = decode_value(raw_value, line_number)?;
                    params.insert(Param {
                        key: key.to_string(),
                        value,
                        quoted,
                        positional: false,
                    });
                } else if let Some(slot) = slots.get(next_slot) {
                    next_slot += 1;
                    let (value, quoted) = decode_value(token, line_number)?;
                    params.insert(Param {
                        key: slot.to_string(),
                        value,
                        quoted,
                        positional: true,
                    });
                } else {
                    return Err(ParseError::new(
                        line_number,
                        format!("{}: expected KEY=value, got {}", kind, token),
                    ));
                }
            }
        }
    }

    Ok(ParsedCommand {
        line_number,
        kind,
        params,
        raw: line.to_string(),
    })
}

fn parse_version(tokens: &[String], line_number: usize) -> Result<VersionInfo, ParseError> {
    let mut info = VersionInfo::default();
    for token in tokens {
        let Some((key, raw)) = split_key(token) else {
            return Err(ParseError::new(
                line_number,
                format!("VERSION: expected KEY=value, got {}", token),
            ));
        };
        let (value, _) = decode_value(raw, line_number)?;
        match key.to_ascii_uppercase().as_str() {
            "BUILD" => info.build = Some(value),
            "RECORDER" => info.recorder = Some(value),
            // Unknown metadata keys are tolerated
            _ => {}
        }
    }
    Ok(info)
}

/// Split a line into raw whitespace-separated tokens.
///
/// Whitespace inside a double-quoted span or inside `{{...}}` does not
/// split. Returns no tokens for blank and comment lines.
fn tokenize(line: &str, line_number: usize) -> Result<Vec<String>, ParseError> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('\'') {
        return Ok(Vec::new());
    }

    let bytes = line.as_bytes();
    let len = bytes.len();
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    let mut quoted = false;
    let mut braces = 0usize;

    let mut i = 0;
    while i < len {
        let b = bytes[i];
        if quoted {
            match b {
                b'\\' => i += 2,
                b'"' => {
                    quoted = false;
                    i += 1;
                }
                _ => i += 1,
            }
            continue;
        }
        match b {
            b' ' | b'\t' | b'\r' | b'\n' if braces == 0 => {
                if let Some(s) = start.take() {
                    tokens.push(line[s..i].to_string());
                }
                i += 1;
            }
            b'"' => {
                start.get_or_insert(i);
                quoted = true;
                i += 1;
            }
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                start.get_or_insert(i);
                braces += 1;
                i += 2;
            }
            b'}' if braces > 0 && bytes.get(i + 1) == Some(&b'}') => {
                braces -= 1;
                i += 2;
            }
            _ => {
                start.get_or_insert(i);
                i += 1;
            }
        }
    }

    if quoted {
        return Err(ParseError::new(line_number, "unterminated quoted value"));
    }
    if let Some(s) = start {
        tokens.push(line[s..].to_string());
    }
    Ok(tokens)
}

/// Split `KEY=value` when the token starts with an identifier followed by `=`.
fn split_key(token: &str) -> Option<(&str, &str)> {
    let eq = token.find('=')?;
    let key = &token[..eq];
    let mut chars = key.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if first_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some((key, &token[eq + 1..]))
    } else {
        None
    }
}

/// Decode a raw value. A value that opens with `"` must be one complete
/// quoted string; anything else is kept verbatim.
fn decode_value(raw: &str, line_number: usize) -> Result<(String, bool), ParseError> {
    let Some(body) = raw.strip_prefix('"') else {
        return Ok((raw.to_string(), false));
    };

    let mut out = String::with_capacity(body.len());
    let mut chars = body.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, '"')) => out.push('"'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, other)) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            '"' => {
                if idx + 1 != body.len() {
                    return Err(ParseError::new(
                        line_number,
                        format!("unexpected text after closing quote in {}", raw),
                    ));
                }
                return Ok((out, true));
            }
            _ => out.push(c),
        }
    }
    Err(ParseError::new(line_number, "unterminated quoted value"))
}

// ──────────────────────────────────────────────────────────
// Serialization
// ──────────────────────────────────────────────────────────

impl ParsedCommand {
    /// Render the command back to macro source.
    pub fn to_source(&self) -> String {
        let mut out = String::from(self.kind.keyword());
        for p in self.params.iter() {
            out.push(' ');
            if !p.positional {
                out.push_str(&p.key);
                out.push('=');
            }
            out.push_str(&format_value(&p.value, p.quoted));
        }
        out
    }
}

impl Macro {
    /// Render the macro in canonical form: no comments or blank lines,
    /// upper-case keywords and keys.
    pub fn to_source(&self) -> String {
        let mut lines = Vec::with_capacity(self.commands.len() + 1);
        if let Some(ref v) = self.version {
            let mut line = String::from("VERSION");
            if let Some(ref b) = v.build {
                line.push_str(&format!(" BUILD={}", format_value(b, needs_quotes(b))));
            }
            if let Some(ref r) = v.recorder {
                line.push_str(&format!(" RECORDER={}", format_value(r, needs_quotes(r))));
            }
            lines.push(line);
        }
        for cmd in &self.commands {
            lines.push(cmd.to_source());
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty() || s.contains([' ', '\t', '"', '\n'])
}

fn format_value(value: &str, quoted: bool) -> String {
    if !quoted {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Unified diff between `source` and its canonical form, or `None` if
/// the source is already canonical.
pub fn canonical_diff(name: &str, source: &str) -> Result<Option<String>, ParseError> {
    let canonical = parse_macro(source)?.to_source();
    if canonical == source {
        return Ok(None);
    }
    let diff = similar::TextDiff::from_lines(source, canonical.as_str());
    let udiff = diff
        .unified_diff()
        .header(name, &format!("{} (canonical)", name))
        .to_string();
    Ok(Some(udiff))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(line: &str) -> ParsedCommand {
        parse_line(line, 1).unwrap().unwrap()
    }

    fn shape(m: &Macro) -> Vec<(CommandKind, Params)> {
        m.commands.iter().map(|c| (c.kind, c.params.clone())).collect()
    }

    #[test]
    fn test_parse_blank_and_comment() {
        assert!(parse_line("", 1).unwrap().is_none());
        assert!(parse_line("   ", 1).unwrap().is_none());
        assert!(parse_line("' a comment", 1).unwrap().is_none());
        assert!(parse_line("   'indented comment", 1).unwrap().is_none());
    }

    #[test]
    fn test_parse_keyed_command() {
        let cmd = parse_one("url goto=https://example.com/?a=1");
        assert_eq!(cmd.kind, CommandKind::Url);
        assert_eq!(cmd.params.get("GOTO"), Some("https://example.com/?a=1"));
    }

    #[test]
    fn test_parse_quoted_value_with_escapes() {
        let cmd = parse_one(r#"TAG POS=1 TYPE=INPUT CONTENT="say \"hi\" now""#);
        let p = cmd.params.param("CONTENT").unwrap();
        assert_eq!(p.value, r#"say "hi" now"#);
        assert!(p.quoted);
    }

    #[test]
    fn test_parse_positional_set_keeps_equals() {
        let cmd = parse_one("SET !VAR1 a=b");
        assert_eq!(cmd.params.get("VAR"), Some("!VAR1"));
        assert_eq!(cmd.params.get("VALUE"), Some("a=b"));
    }

    #[test]
    fn test_braces_protect_whitespace() {
        let cmd = parse_one("SET !VAR2 {{!VAR1 + 1}}");
        assert_eq!(cmd.params.get("VALUE"), Some("{{!VAR1 + 1}}"));
        assert!(!cmd.params.param("VALUE").unwrap().quoted);
    }

    #[test]
    fn test_quoted_span_inside_token() {
        let cmd = parse_one(r#"TAG POS=1 TYPE=A ATTR=TXT:"Next page""#);
        assert_eq!(cmd.params.get("ATTR"), Some(r#"TXT:"Next page""#));
    }

    #[test]
    fn test_unknown_command_names_keyword_and_line() {
        let err = parse_line("FROBNICATE X=1", 7).unwrap_err();
        assert_eq!(err.line, 7);
        assert!(err.message.contains("FROBNICATE"));
    }

    #[test]
    fn test_unterminated_quote() {
        let err = parse_line(r#"SET !VAR1 "open"#, 3).unwrap_err();
        assert!(err.message.contains("unterminated"));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_text_after_closing_quote() {
        let err = parse_line(r#"TAG CONTENT="a"b"#, 1).unwrap_err();
        assert!(err.message.contains("after closing quote"));
    }

    #[test]
    fn test_surplus_positional_is_error() {
        let err = parse_line("SET !VAR1 a b", 1).unwrap_err();
        assert!(err.message.contains("unexpected argument"));
        let err = parse_line("WAIT 3", 1).unwrap_err();
        assert!(err.message.contains("expected KEY=value"));
    }

    #[test]
    fn test_duplicate_key_last_occurrence_wins() {
        let cmd = parse_one("WAIT SECONDS=1 SECONDS=2");
        assert_eq!(cmd.params.len(), 1);
        assert_eq!(cmd.params.get("SECONDS"), Some("2"));
    }

    #[test]
    fn test_tab_bare_action() {
        let cmd = parse_one("TAB CLOSE");
        assert_eq!(cmd.params.get("ACTION"), Some("CLOSE"));
    }

    #[test]
    fn test_version_is_metadata() {
        let m = parse_macro("VERSION BUILD=8970419 RECORDER=FX\nURL GOTO=about:blank\n").unwrap();
        assert_eq!(m.commands.len(), 1);
        let v = m.version.unwrap();
        assert_eq!(v.build.as_deref(), Some("8970419"));
        assert_eq!(v.recorder.as_deref(), Some("FX"));
    }

    #[test]
    fn test_line_numbers_skip_comments() {
        let m = parse_macro("' header\n\nURL GOTO=a\n' mid\nWAIT SECONDS=1").unwrap();
        let lines: Vec<usize> = m.commands.iter().map(|c| c.line_number).collect();
        assert_eq!(lines, vec![3, 5]);
    }

    #[test]
    fn test_parse_macro_fails_whole_parse() {
        let err = parse_macro("URL GOTO=a\nBOGUS\nWAIT SECONDS=1").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_round_trip() {
        let src = r#"VERSION BUILD=1 RECORDER=CR
' comment
set !var1 "hello world"
SET !VAR2 {{!VAR1 + 1}}
tag pos=R1 type=INPUT:TEXT attr=NAME:q content="line\nbreak \"quoted\" back\\slash"
TAB CLOSE
SEARCH SOURCE=REGEXP:"a b" EXTRACT=$1
PROMPT "Your name?" !VAR3 ""
URL GOTO=http://x.test/?q={{!VAR1}}
"#;
        let first = parse_macro(src).unwrap();
        let rendered = first.to_source();
        let second = parse_macro(&rendered).unwrap();
        assert_eq!(shape(&first), shape(&second));
        assert_eq!(first.version, second.version);
        // Canonical form is a fixed point
        assert_eq!(second.to_source(), rendered);
    }

    #[test]
    fn test_canonical_diff() {
        let canonical = "SET !VAR1 x\nURL GOTO=https://example.com\n";
        assert_eq!(canonical_diff("a.iim", canonical).unwrap(), None);

        let diff = canonical_diff("a.iim", "' comment\nurl goto=https://example.com\n")
            .unwrap()
            .unwrap();
        assert!(diff.contains("-url goto=https://example.com"));
        assert!(diff.contains("+URL GOTO=https://example.com"));
        assert!(canonical_diff("a.iim", "BOGUS\n").is_err());
    }
}
