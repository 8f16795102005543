//! Command vocabulary and typed actions
//!
//! The parser only knows *which* command a line names and the raw text of
//! its parameters. Once the executor has expanded those parameters,
//! [`Action::from_params`] turns them into one closed variant per command,
//! with every field already checked and typed.

use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorCode, MacroError};
use crate::value::parse_number;

/// A macro command keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    Add,
    Back,
    Clear,
    Click,
    Cmdline,
    Ds,
    Event,
    Events,
    Extract,
    FileDelete,
    Filter,
    Frame,
    ImageClick,
    ImageSearch,
    OnDialog,
    OnDownload,
    OnLogin,
    Pause,
    Prompt,
    Refresh,
    SaveAs,
    SaveItem,
    Screenshot,
    Search,
    Set,
    Size,
    Stopwatch,
    Tab,
    Tag,
    Url,
    Wait,
}

/// How a command's tokens map onto named parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLayout {
    /// Every token fills the next named slot; `=` inside a token is data.
    Positional(&'static [&'static str]),
    /// `KEY=value` tokens, plus the listed slots for bare tokens.
    Keyed(&'static [&'static str]),
}

/// Which timeout window governs a command's retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Element and image lookups (`!TIMEOUT_STEP`)
    Step,
    /// Page navigation (`!TIMEOUT_PAGE`)
    Page,
    /// Never retried
    None,
}

impl CommandKind {
    pub const ALL: [CommandKind; 31] = [
        CommandKind::Add,
        CommandKind::Back,
        CommandKind::Clear,
        CommandKind::Click,
        CommandKind::Cmdline,
        CommandKind::Ds,
        CommandKind::Event,
        CommandKind::Events,
        CommandKind::Extract,
        CommandKind::FileDelete,
        CommandKind::Filter,
        CommandKind::Frame,
        CommandKind::ImageClick,
        CommandKind::ImageSearch,
        CommandKind::OnDialog,
        CommandKind::OnDownload,
        CommandKind::OnLogin,
        CommandKind::Pause,
        CommandKind::Prompt,
        CommandKind::Refresh,
        CommandKind::SaveAs,
        CommandKind::SaveItem,
        CommandKind::Screenshot,
        CommandKind::Search,
        CommandKind::Set,
        CommandKind::Size,
        CommandKind::Stopwatch,
        CommandKind::Tab,
        CommandKind::Tag,
        CommandKind::Url,
        CommandKind::Wait,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            CommandKind::Add => "ADD",
            CommandKind::Back => "BACK",
            CommandKind::Clear => "CLEAR",
            CommandKind::Click => "CLICK",
            CommandKind::Cmdline => "CMDLINE",
            CommandKind::Ds => "DS",
            CommandKind::Event => "EVENT",
            CommandKind::Events => "EVENTS",
            CommandKind::Extract => "EXTRACT",
            CommandKind::FileDelete => "FILEDELETE",
            CommandKind::Filter => "FILTER",
            CommandKind::Frame => "FRAME",
            CommandKind::ImageClick => "IMAGECLICK",
            CommandKind::ImageSearch => "IMAGESEARCH",
            CommandKind::OnDialog => "ONDIALOG",
            CommandKind::OnDownload => "ONDOWNLOAD",
            CommandKind::OnLogin => "ONLOGIN",
            CommandKind::Pause => "PAUSE",
            CommandKind::Prompt => "PROMPT",
            CommandKind::Refresh => "REFRESH",
            CommandKind::SaveAs => "SAVEAS",
            CommandKind::SaveItem => "SAVEITEM",
            CommandKind::Screenshot => "SCREENSHOT",
            CommandKind::Search => "SEARCH",
            CommandKind::Set => "SET",
            CommandKind::Size => "SIZE",
            CommandKind::Stopwatch => "STOPWATCH",
            CommandKind::Tab => "TAB",
            CommandKind::Tag => "TAG",
            CommandKind::Url => "URL",
            CommandKind::Wait => "WAIT",
        }
    }

    pub fn layout(self) -> ParamLayout {
        match self {
            CommandKind::Set | CommandKind::Add | CommandKind::Cmdline => {
                ParamLayout::Positional(&["VAR", "VALUE"])
            }
            CommandKind::Prompt => ParamLayout::Positional(&["MESSAGE", "VAR", "DEFAULT"]),
            CommandKind::Tab => ParamLayout::Keyed(&["ACTION"]),
            CommandKind::Clear => ParamLayout::Keyed(&["WHAT"]),
            CommandKind::Url => ParamLayout::Keyed(&["CURRENT"]),
            _ => ParamLayout::Keyed(&[]),
        }
    }

    /// Commands the interpreter runs itself instead of dispatching to a host handler.
    pub fn is_builtin(self) -> bool {
        matches!(
            self,
            CommandKind::Set
                | CommandKind::Add
                | CommandKind::Cmdline
                | CommandKind::Wait
                | CommandKind::Pause
                | CommandKind::Stopwatch
                | CommandKind::Ds
        )
    }

    pub fn timeout_class(self) -> TimeoutClass {
        match self {
            CommandKind::Tag
            | CommandKind::Click
            | CommandKind::Event
            | CommandKind::Events
            | CommandKind::Search
            | CommandKind::Extract
            | CommandKind::ImageSearch
            | CommandKind::ImageClick => TimeoutClass::Step,
            CommandKind::Url | CommandKind::Back | CommandKind::Refresh => TimeoutClass::Page,
            _ => TimeoutClass::None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for CommandKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .iter()
            .copied()
            .find(|k| k.keyword().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

// ──────────────────────────────────────────────────────────
// Parameters
// ──────────────────────────────────────────────────────────

/// One parameter as written in the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Upper-cased key (slot name for positional parameters)
    pub key: String,
    /// Raw text (unescaped if quoted, otherwise verbatim)
    pub value: String,
    /// Whether the value was double-quoted
    pub quoted: bool,
    /// Whether the value was written without a `KEY=` prefix
    pub positional: bool,
}

/// Ordered parameter mapping, keys case-insensitive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    items: Vec<Param>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter. A repeated key overwrites the earlier value but
    /// keeps the earlier position.
    pub fn insert(&mut self, param: Param) {
        let mut param = param;
        param.key = param.key.to_ascii_uppercase();
        if let Some(existing) = self.items.iter_mut().find(|p| p.key == param.key) {
            *existing = param;
        } else {
            self.items.push(param);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.param(key).map(|p| p.value.as_str())
    }

    pub fn param(&self, key: &str) -> Option<&Param> {
        self.items.iter().find(|p| p.key.eq_ignore_ascii_case(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.param(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Param> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ──────────────────────────────────────────────────────────
// Typed actions
// ──────────────────────────────────────────────────────────

/// How an element is located on the page
#[derive(Debug, Clone, PartialEq)]
pub enum Locator {
    /// `POS=n TYPE=el [FORM=..] [ATTR=..]`
    Position {
        pos: TagPos,
        element: String,
        form: Option<String>,
        attr: Option<String>,
    },
    Xpath(String),
    Selector(String),
}

/// `POS=3` counts from the top of the page; `POS=R2` from the last match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagPos {
    Absolute(i64),
    Relative(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagSpec {
    pub locator: Locator,
    pub content: Option<String>,
    pub extract: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UrlTarget {
    Goto(String),
    Current,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventSpec {
    pub event_type: String,
    pub locator: Option<Locator>,
    pub button: Option<u8>,
    pub key: Option<i64>,
    pub chars: Option<String>,
    pub point: Option<(i64, i64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchSource {
    Text(String),
    Regexp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabAction {
    Select(u32),
    Open,
    Close,
    CloseAllOthers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameTarget {
    Index(u32),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    pub pos: u32,
    pub image: String,
    /// Match confidence in percent
    pub confidence: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopwatchAction {
    Toggle,
    Start,
    Stop,
    Lap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsCommand {
    Next,
    Previous,
    Reset,
    Clear,
}

/// A validated command with typed fields
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Url(UrlTarget),
    Tag(TagSpec),
    Extract(TagSpec),
    Click { x: i64, y: i64, content: Option<String> },
    Event(EventSpec),
    Events(EventSpec),
    Search { source: SearchSource, ignore_case: bool, extract: Option<String> },
    Set { var: String, value: String },
    Add { var: String, value: String },
    Cmdline { var: String, default: Option<String> },
    Wait { seconds: f64 },
    Pause,
    Prompt { message: String, var: Option<String>, default: Option<String> },
    Tab(TabAction),
    Frame(FrameTarget),
    Back,
    Refresh,
    SaveAs { kind: String, folder: Option<String>, file: String },
    SaveItem,
    Screenshot { kind: String, folder: Option<String>, file: String },
    FileDelete { name: String },
    ImageSearch(ImageSpec),
    ImageClick(ImageSpec),
    OnDialog { pos: u32, button: String, content: Option<String> },
    OnDownload { folder: String, file: String, wait: bool },
    OnLogin { user: String, password: String },
    Clear { what: Option<String> },
    Filter { kind: String, enabled: bool },
    Size { x: u32, y: u32 },
    Stopwatch { id: String, action: StopwatchAction },
    Ds(DsCommand),
}

impl Action {
    /// Validate expanded parameters for `kind` and build the typed action.
    pub fn from_params(kind: CommandKind, p: &Params) -> Result<Action, MacroError> {
        let cmd = kind.keyword();
        let action = match kind {
            CommandKind::Url => match p.get("GOTO") {
                Some(url) if !url.is_empty() => Action::Url(UrlTarget::Goto(url.to_string())),
                Some(_) => return Err(MacroError::invalid("GOTO", "", "a URL")),
                None if p.contains("CURRENT") => Action::Url(UrlTarget::Current),
                None => return Err(MacroError::missing(cmd, "GOTO")),
            },
            CommandKind::Tag => Action::Tag(tag_spec(cmd, p, None)?),
            CommandKind::Extract => Action::Extract(tag_spec(cmd, p, Some("TXT"))?),
            CommandKind::Click => Action::Click {
                x: int_param(p, "X")?.ok_or_else(|| MacroError::missing(cmd, "X"))?,
                y: int_param(p, "Y")?.ok_or_else(|| MacroError::missing(cmd, "Y"))?,
                content: opt(p, "CONTENT"),
            },
            CommandKind::Event => Action::Event(event_spec(cmd, p)?),
            CommandKind::Events => Action::Events(event_spec(cmd, p)?),
            CommandKind::Search => {
                let raw = required(cmd, p, "SOURCE")?;
                let source = match raw.split_once(':') {
                    Some((t, pat)) if t.eq_ignore_ascii_case("TXT") => {
                        SearchSource::Text(pat.to_string())
                    }
                    Some((t, pat)) if t.eq_ignore_ascii_case("REGEXP") => {
                        SearchSource::Regexp(pat.to_string())
                    }
                    _ => return Err(MacroError::invalid("SOURCE", raw, "TXT:<text> or REGEXP:<pattern>")),
                };
                Action::Search {
                    source,
                    ignore_case: yes_no(p, "IGNORE_CASE")?.unwrap_or(false),
                    extract: opt(p, "EXTRACT"),
                }
            }
            CommandKind::Set => Action::Set {
                var: variable_name(cmd, p)?,
                value: required(cmd, p, "VALUE")?.to_string(),
            },
            CommandKind::Add => Action::Add {
                var: variable_name(cmd, p)?,
                value: required(cmd, p, "VALUE")?.to_string(),
            },
            CommandKind::Cmdline => Action::Cmdline {
                var: variable_name(cmd, p)?,
                default: opt(p, "VALUE"),
            },
            CommandKind::Wait => {
                let raw = required(cmd, p, "SECONDS")?;
                match parse_number(raw) {
                    Some(s) if s >= 0.0 => Action::Wait { seconds: s },
                    _ => return Err(MacroError::invalid("SECONDS", raw, "a non-negative number")),
                }
            }
            CommandKind::Pause => Action::Pause,
            CommandKind::Prompt => Action::Prompt {
                message: required(cmd, p, "MESSAGE")?.to_string(),
                var: opt(p, "VAR"),
                default: opt(p, "DEFAULT"),
            },
            CommandKind::Tab => {
                if let Some(n) = uint_param(p, "T")? {
                    if n == 0 {
                        return Err(MacroError::invalid("T", "0", "a tab number starting at 1"));
                    }
                    Action::Tab(TabAction::Select(n))
                } else {
                    let raw = p.get("ACTION").ok_or_else(|| MacroError::missing(cmd, "T"))?;
                    let action = match raw.to_ascii_uppercase().as_str() {
                        "OPEN" => TabAction::Open,
                        "CLOSE" => TabAction::Close,
                        "CLOSEALLOTHERS" => TabAction::CloseAllOthers,
                        _ => return Err(MacroError::invalid("TAB", raw, "T=n, OPEN, CLOSE or CLOSEALLOTHERS")),
                    };
                    Action::Tab(action)
                }
            }
            CommandKind::Frame => {
                if let Some(n) = uint_param(p, "F")? {
                    Action::Frame(FrameTarget::Index(n))
                } else if let Some(name) = opt(p, "NAME") {
                    Action::Frame(FrameTarget::Name(name))
                } else {
                    return Err(MacroError::missing(cmd, "F"));
                }
            }
            CommandKind::Back => Action::Back,
            CommandKind::Refresh => Action::Refresh,
            CommandKind::SaveAs => Action::SaveAs {
                kind: required(cmd, p, "TYPE")?.to_ascii_uppercase(),
                folder: opt(p, "FOLDER"),
                file: required(cmd, p, "FILE")?.to_string(),
            },
            CommandKind::SaveItem => Action::SaveItem,
            CommandKind::Screenshot => Action::Screenshot {
                kind: required(cmd, p, "TYPE")?.to_ascii_uppercase(),
                folder: opt(p, "FOLDER"),
                file: required(cmd, p, "FILE")?.to_string(),
            },
            CommandKind::FileDelete => Action::FileDelete {
                name: required(cmd, p, "NAME")?.to_string(),
            },
            CommandKind::ImageSearch => Action::ImageSearch(image_spec(cmd, p)?),
            CommandKind::ImageClick => Action::ImageClick(image_spec(cmd, p)?),
            CommandKind::OnDialog => Action::OnDialog {
                pos: uint_param(p, "POS")?.unwrap_or(1),
                button: required(cmd, p, "BUTTON")?.to_ascii_uppercase(),
                content: opt(p, "CONTENT"),
            },
            CommandKind::OnDownload => Action::OnDownload {
                folder: required(cmd, p, "FOLDER")?.to_string(),
                file: required(cmd, p, "FILE")?.to_string(),
                wait: yes_no(p, "WAIT")?.unwrap_or(true),
            },
            CommandKind::OnLogin => Action::OnLogin {
                user: required(cmd, p, "USER")?.to_string(),
                password: required(cmd, p, "PASSWORD")?.to_string(),
            },
            CommandKind::Clear => Action::Clear { what: opt(p, "WHAT") },
            CommandKind::Filter => {
                let status = required(cmd, p, "STATUS")?;
                let enabled = match status.to_ascii_uppercase().as_str() {
                    "ON" => true,
                    "OFF" => false,
                    _ => return Err(MacroError::invalid("STATUS", status, "ON or OFF")),
                };
                Action::Filter {
                    kind: required(cmd, p, "TYPE")?.to_ascii_uppercase(),
                    enabled,
                }
            }
            CommandKind::Size => Action::Size {
                x: uint_param(p, "X")?.ok_or_else(|| MacroError::missing(cmd, "X"))?,
                y: uint_param(p, "Y")?.ok_or_else(|| MacroError::missing(cmd, "Y"))?,
            },
            CommandKind::Stopwatch => {
                let action = match p.get("ACTION") {
                    None => StopwatchAction::Toggle,
                    Some(a) => match a.to_ascii_uppercase().as_str() {
                        "START" => StopwatchAction::Start,
                        "STOP" => StopwatchAction::Stop,
                        "LAP" => StopwatchAction::Lap,
                        _ => return Err(MacroError::invalid("ACTION", a, "START, STOP or LAP")),
                    },
                };
                Action::Stopwatch {
                    id: required(cmd, p, "ID")?.to_ascii_uppercase(),
                    action,
                }
            }
            CommandKind::Ds => {
                let raw = required(cmd, p, "CMD")?;
                let ds = match raw.to_ascii_uppercase().as_str() {
                    "NEXT" => DsCommand::Next,
                    "PREVIOUS" => DsCommand::Previous,
                    "RESET" => DsCommand::Reset,
                    "CLEAR" => DsCommand::Clear,
                    _ => return Err(MacroError::invalid("CMD", raw, "NEXT, PREVIOUS, RESET or CLEAR")),
                };
                Action::Ds(ds)
            }
        };
        Ok(action)
    }

    /// Whether a handler's `output` for this action belongs in `!EXTRACT`.
    pub fn extracts(&self) -> bool {
        match self {
            Action::Tag(spec) => spec.extract.is_some(),
            Action::Extract(_) => true,
            Action::Search { extract, .. } => extract.is_some(),
            _ => false,
        }
    }
}

// ──────────────────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────────────────

fn required<'a>(cmd: &str, p: &'a Params, key: &str) -> Result<&'a str, MacroError> {
    p.get(key).ok_or_else(|| MacroError::missing(cmd, key))
}

fn opt(p: &Params, key: &str) -> Option<String> {
    p.get(key).map(|s| s.to_string())
}

fn variable_name(cmd: &str, p: &Params) -> Result<String, MacroError> {
    let name = required(cmd, p, "VAR")?;
    let valid = {
        let body = name.strip_prefix('!').unwrap_or(name);
        let mut chars = body.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
    };
    if !valid {
        return Err(MacroError::invalid("VAR", name, "a variable name"));
    }
    Ok(name.to_string())
}

fn int_param(p: &Params, key: &str) -> Result<Option<i64>, MacroError> {
    match p.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| MacroError::invalid(key, raw, "an integer")),
    }
}

fn uint_param(p: &Params, key: &str) -> Result<Option<u32>, MacroError> {
    match p.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| MacroError::invalid(key, raw, "a non-negative integer")),
    }
}

fn yes_no(p: &Params, key: &str) -> Result<Option<bool>, MacroError> {
    match p.get(key) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_uppercase().as_str() {
            "YES" | "TRUE" => Ok(Some(true)),
            "NO" | "FALSE" => Ok(Some(false)),
            _ => Err(MacroError::invalid(key, raw, "YES or NO")),
        },
    }
}

fn parse_pos(raw: &str) -> Result<TagPos, MacroError> {
    let t = raw.trim();
    let (relative, digits) = match t.strip_prefix(['R', 'r']) {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let n: i64 = digits
        .parse()
        .map_err(|_| MacroError::invalid("POS", raw, "n or Rn"))?;
    if n == 0 {
        return Err(MacroError::invalid("POS", raw, "a non-zero position"));
    }
    Ok(if relative { TagPos::Relative(n) } else { TagPos::Absolute(n) })
}

fn locator(cmd: &str, p: &Params) -> Result<Option<Locator>, MacroError> {
    if let Some(x) = p.get("XPATH") {
        return Ok(Some(Locator::Xpath(x.to_string())));
    }
    if let Some(s) = p.get("SELECTOR") {
        return Ok(Some(Locator::Selector(s.to_string())));
    }
    match (p.get("POS"), p.get("TYPE")) {
        (Some(pos), Some(element)) => Ok(Some(Locator::Position {
            pos: parse_pos(pos)?,
            element: element.to_ascii_uppercase(),
            form: opt(p, "FORM"),
            attr: opt(p, "ATTR"),
        })),
        (Some(_), None) => Err(MacroError::missing(cmd, "TYPE")),
        (None, Some(_)) => Err(MacroError::missing(cmd, "POS")),
        (None, None) => Ok(None),
    }
}

fn tag_spec(cmd: &str, p: &Params, default_extract: Option<&str>) -> Result<TagSpec, MacroError> {
    let locator = locator(cmd, p)?
        .ok_or_else(|| MacroError::missing(cmd, "POS/TYPE, XPATH or SELECTOR"))?;
    let extract = opt(p, "EXTRACT").or_else(|| default_extract.map(|s| s.to_string()));
    Ok(TagSpec {
        locator,
        content: opt(p, "CONTENT"),
        extract,
    })
}

fn event_spec(cmd: &str, p: &Params) -> Result<EventSpec, MacroError> {
    let event_type = required(cmd, p, "TYPE")?.to_ascii_uppercase();
    let button = match p.get("BUTTON") {
        None => None,
        Some(raw) => Some(
            raw.trim()
                .parse::<u8>()
                .map_err(|_| MacroError::invalid("BUTTON", raw, "0, 1 or 2"))?,
        ),
    };
    let point = match p.get("POINT") {
        None => None,
        Some(raw) => Some(parse_point(raw)?),
    };
    // Element-less events (e.g. keypresses) target the focused element
    let loc = if p.contains("POS") || p.contains("XPATH") || p.contains("SELECTOR") {
        locator(cmd, p)?
    } else {
        None
    };
    Ok(EventSpec {
        event_type,
        locator: loc,
        button,
        key: int_param(p, "KEY")?,
        chars: opt(p, "CHARS"),
        point,
    })
}

fn parse_point(raw: &str) -> Result<(i64, i64), MacroError> {
    let inner = raw.trim().trim_start_matches('(').trim_end_matches(')');
    let bad = || MacroError::invalid("POINT", raw, "(x,y)");
    let (x, y) = inner.split_once(',').ok_or_else(bad)?;
    let x = x.trim().parse::<i64>().map_err(|_| bad())?;
    let y = y.trim().parse::<i64>().map_err(|_| bad())?;
    Ok((x, y))
}

fn image_spec(cmd: &str, p: &Params) -> Result<ImageSpec, MacroError> {
    let image = required(cmd, p, "IMAGE")?;
    if image.trim().is_empty() {
        return Err(MacroError::new(ErrorCode::InvalidParameter, "IMAGE must name a file"));
    }
    let confidence = match p.get("CONFIDENCE") {
        None => 95,
        Some(raw) => match raw.trim().parse::<u8>() {
            Ok(c) if c <= 100 => c,
            _ => return Err(MacroError::invalid("CONFIDENCE", raw, "0..100")),
        },
    };
    Ok(ImageSpec {
        pos: uint_param(p, "POS")?.unwrap_or(1),
        image: image.to_string(),
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        let mut p = Params::new();
        for (k, v) in pairs {
            p.insert(Param {
                key: k.to_string(),
                value: v.to_string(),
                quoted: false,
                positional: false,
            });
        }
        p
    }

    #[test]
    fn test_keyword_lookup_is_case_insensitive() {
        assert_eq!("tag".parse::<CommandKind>(), Ok(CommandKind::Tag));
        assert_eq!("ImageSearch".parse::<CommandKind>(), Ok(CommandKind::ImageSearch));
        assert!("GOTO".parse::<CommandKind>().is_err());
    }

    #[test]
    fn test_duplicate_key_last_wins_first_position() {
        let p = params(&[("a", "1"), ("b", "2"), ("A", "3")]);
        assert_eq!(p.len(), 2);
        assert_eq!(p.get("a"), Some("3"));
        assert_eq!(p.iter().next().map(|x| x.key.as_str()), Some("A"));
    }

    #[test]
    fn test_tag_position_locator() {
        let p = params(&[("POS", "R2"), ("TYPE", "input:text"), ("ATTR", "NAME:q"), ("CONTENT", "hi")]);
        let action = Action::from_params(CommandKind::Tag, &p).unwrap();
        match action {
            Action::Tag(spec) => {
                assert_eq!(
                    spec.locator,
                    Locator::Position {
                        pos: TagPos::Relative(2),
                        element: "INPUT:TEXT".into(),
                        form: None,
                        attr: Some("NAME:q".into()),
                    }
                );
                assert_eq!(spec.content.as_deref(), Some("hi"));
                assert!(spec.extract.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tag_missing_locator() {
        let err = Action::from_params(CommandKind::Tag, &params(&[("CONTENT", "x")])).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingParameter);
        let err = Action::from_params(CommandKind::Tag, &params(&[("POS", "1")])).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingParameter);
    }

    #[test]
    fn test_tag_bad_pos_is_invalid() {
        let p = params(&[("POS", "first"), ("TYPE", "A")]);
        let err = Action::from_params(CommandKind::Tag, &p).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }

    #[test]
    fn test_wait_validation() {
        let ok = Action::from_params(CommandKind::Wait, &params(&[("SECONDS", "1.5")])).unwrap();
        assert_eq!(ok, Action::Wait { seconds: 1.5 });
        let err = Action::from_params(CommandKind::Wait, &params(&[("SECONDS", "-1")])).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
        let err = Action::from_params(CommandKind::Wait, &params(&[])).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingParameter);
    }

    #[test]
    fn test_tab_forms() {
        let t = Action::from_params(CommandKind::Tab, &params(&[("T", "2")])).unwrap();
        assert_eq!(t, Action::Tab(TabAction::Select(2)));
        let t = Action::from_params(CommandKind::Tab, &params(&[("ACTION", "close")])).unwrap();
        assert_eq!(t, Action::Tab(TabAction::Close));
    }

    #[test]
    fn test_extract_defaults_to_text() {
        let a = Action::from_params(CommandKind::Extract, &params(&[("XPATH", "//h1")])).unwrap();
        assert!(a.extracts());
        match a {
            Action::Extract(spec) => assert_eq!(spec.extract.as_deref(), Some("TXT")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_search_source() {
        let a = Action::from_params(
            CommandKind::Search,
            &params(&[("SOURCE", "REGEXP:a(b)c"), ("EXTRACT", "$1")]),
        )
        .unwrap();
        assert_eq!(
            a,
            Action::Search {
                source: SearchSource::Regexp("a(b)c".into()),
                ignore_case: false,
                extract: Some("$1".into()),
            }
        );
    }

    #[test]
    fn test_image_confidence_range() {
        let err = Action::from_params(
            CommandKind::ImageSearch,
            &params(&[("IMAGE", "btn.png"), ("CONFIDENCE", "120")]),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }

    #[test]
    fn test_set_rejects_bad_variable_name() {
        let err = Action::from_params(CommandKind::Set, &params(&[("VAR", "1abc"), ("VALUE", "x")]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }
}
