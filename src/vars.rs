//! Variable store
//!
//! Owns every value a macro can reference by name:
//! - fixed slots `!VAR0`..`!VAR9`, always present
//! - system settings such as `!ERRORIGNORE` and `!TIMEOUT_STEP`
//! - computed views (`!LOOP`, `!EXTRACT`, `!COLn`, `!DATASOURCE*`, `!NOW:fmt`)
//! - free-form user variables, created on first write
//!
//! Names are case-insensitive; the canonical key is the upper-cased name.
//! Reading a name that was never written yields `None`, which is distinct
//! from the empty string.

use std::collections::HashMap;

use chrono::{Datelike, Local, Timelike};

use crate::error::{ErrorCode, MacroError};
use crate::expr::VariableSource;
use crate::value::{format_number, Value};

/// Separator used when `!EXTRACT` is read as one string
pub const EXTRACT_SEPARATOR: &str = "[EXTRACT]";

/// Number of datasource columns mirrored as `!COL1`..`!COL10`
pub const MIRRORED_COLUMNS: usize = 10;

/// System variables a macro may write with `SET`
const SETTABLE_SYSTEM: &[&str] = &[
    "!ERRORIGNORE",
    "!TIMEOUT",
    "!TIMEOUT_STEP",
    "!TIMEOUT_PAGE",
    "!TIMEOUT_TAG",
    "!REPLAYSPEED",
    "!DATASOURCE_DELIMITER",
    "!URLCURRENT",
    "!CLIPBOARD",
    "!FOLDER_DATASOURCE",
    "!FILESTOPWATCH",
    "!SINGLESTEP",
    "!WAITPAGECOMPLETE",
    "!POPUP_ALLOWED",
    "!ENCRYPTION",
];

/// Which part of the store [`VariableStore::clear`] resets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// `!VAR0`..`!VAR9`
    Slots,
    /// Free-form user variables
    User,
    /// The extraction buffer
    Extract,
    /// Slots, user variables and the extraction buffer
    All,
}

/// The datasource row as the store sees it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasourceView {
    /// File identifier shown as `!DATASOURCE`
    pub name: String,
    /// 1-based current line shown as `!DATASOURCE_LINE`
    pub line: usize,
    pub columns: usize,
    /// At most [`MIRRORED_COLUMNS`] fields of the current row
    pub fields: Vec<String>,
}

/// Per-run variable storage
#[derive(Debug, Clone)]
pub struct VariableStore {
    slots: [String; 10],
    /// User variables, ordered by first write
    user: Vec<(String, Value)>,
    /// Index for O(1) lookup by canonical key → position in `user`
    user_index: HashMap<String, usize>,
    system: HashMap<String, String>,
    extract: Vec<String>,
    loop_counter: u64,
    datasource: Option<DatasourceView>,
    stopwatch_time: Option<f64>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        let mut store = Self {
            slots: Default::default(),
            user: Vec::new(),
            user_index: HashMap::new(),
            system: HashMap::new(),
            extract: Vec::new(),
            loop_counter: 1,
            datasource: None,
            stopwatch_time: None,
        };
        store.system.insert("!ERRORIGNORE".into(), "NO".into());
        store.system.insert("!REPLAYSPEED".into(), "FAST".into());
        store
    }

    /// Read a variable. `None` means the name is undefined.
    pub fn get(&self, name: &str) -> Option<Value> {
        let key = canonical(name);

        if let Some(n) = slot_index(&key) {
            return Some(Value::Str(self.slots[n].clone()));
        }
        if let Some(fmt) = key.strip_prefix("!NOW:") {
            return Some(Value::Str(format_now(fmt)));
        }
        if let Some(n) = col_index(&key) {
            return self
                .datasource
                .as_ref()
                .map(|ds| Value::Str(ds.fields.get(n - 1).cloned().unwrap_or_default()));
        }

        match key.as_str() {
            "!LOOP" => Some(Value::Num(self.loop_counter as f64)),
            "!EXTRACT" => Some(Value::Str(self.extract.join(EXTRACT_SEPARATOR))),
            "!DATASOURCE" => Some(Value::Str(
                self.datasource.as_ref().map(|d| d.name.clone()).unwrap_or_default(),
            )),
            "!DATASOURCE_LINE" => Some(Value::Num(
                self.datasource.as_ref().map_or(0, |d| d.line) as f64,
            )),
            "!DATASOURCE_COLUMNS" => Some(Value::Num(
                self.datasource.as_ref().map_or(0, |d| d.columns) as f64,
            )),
            "!STOPWATCHTIME" => self
                .stopwatch_time
                .map(|t| Value::Str(format!("{:.3}", t))),
            k if k.starts_with('!') => self.system.get(k).map(|v| Value::Str(v.clone())),
            k => self.user_index.get(k).map(|&i| self.user[i].1.clone()),
        }
    }

    /// Read a variable as text, treating undefined as empty.
    pub fn get_text(&self, name: &str) -> String {
        self.get(name).map(Value::into_text).unwrap_or_default()
    }

    /// Write a variable.
    ///
    /// Computed names are read-only here; `!DATASOURCE` and
    /// `!DATASOURCE_LINE` belong to the datasource cursor.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), MacroError> {
        let key = canonical(name);
        let value = value.into();

        if let Some(n) = slot_index(&key) {
            self.slots[n] = value.into_text();
            return Ok(());
        }
        if key == "!EXTRACT" {
            let text = value.into_text();
            self.extract.clear();
            if !text.is_empty() && !text.eq_ignore_ascii_case("NULL") {
                self.extract.push(text);
            }
            return Ok(());
        }
        if is_read_only(&key) {
            return Err(MacroError::new(
                ErrorCode::InvalidParameter,
                format!("{} is read-only", key),
            ));
        }
        if key.starts_with('!') {
            if !SETTABLE_SYSTEM.contains(&key.as_str()) {
                return Err(MacroError::new(
                    ErrorCode::InvalidParameter,
                    format!("unknown system variable {}", key),
                ));
            }
            self.system.insert(key, value.into_text());
            return Ok(());
        }

        if let Some(&i) = self.user_index.get(&key) {
            self.user[i].1 = value;
        } else {
            self.user_index.insert(key.clone(), self.user.len());
            self.user.push((key, value));
        }
        Ok(())
    }

    /// Add `delta` to a variable. A missing or non-numeric current value
    /// counts as 0; the sum is written back as text.
    pub fn add(&mut self, name: &str, delta: f64) -> Result<(), MacroError> {
        let current = self.get(name).and_then(|v| v.as_number()).unwrap_or(0.0);
        self.set(name, format_number(current + delta))
    }

    /// Append text to a variable (legacy `ADD` with a non-numeric value).
    pub fn append(&mut self, name: &str, text: &str) -> Result<(), MacroError> {
        if canonical(name) == "!EXTRACT" {
            self.add_extract(text);
            return Ok(());
        }
        let mut current = self.get_text(name);
        current.push_str(text);
        self.set(name, current)
    }

    pub fn clear(&mut self, scope: Scope) {
        if matches!(scope, Scope::Slots | Scope::All) {
            self.slots = Default::default();
        }
        if matches!(scope, Scope::User | Scope::All) {
            self.user.clear();
            self.user_index.clear();
        }
        if matches!(scope, Scope::Extract | Scope::All) {
            self.extract.clear();
        }
    }

    // ── extraction buffer ───────────────────────────────────

    pub fn add_extract(&mut self, value: impl Into<String>) {
        self.extract.push(value.into());
    }

    pub fn clear_extract(&mut self) {
        self.extract.clear();
    }

    pub fn extract_values(&self) -> &[String] {
        &self.extract
    }

    // ── loop counter ────────────────────────────────────────

    pub fn loop_counter(&self) -> u64 {
        self.loop_counter
    }

    pub fn increment_loop(&mut self) -> u64 {
        self.loop_counter += 1;
        self.loop_counter
    }

    pub fn reset_loop(&mut self) {
        self.loop_counter = 1;
    }

    // ── datasource mirror ───────────────────────────────────

    /// Replace the datasource mirror. `None` clears it: `!COLn` become
    /// undefined, `!DATASOURCE` empty and `!DATASOURCE_LINE` zero.
    pub fn set_datasource_view(&mut self, view: Option<DatasourceView>) {
        self.datasource = view;
    }

    pub fn datasource_view(&self) -> Option<&DatasourceView> {
        self.datasource.as_ref()
    }

    pub fn set_stopwatch_time(&mut self, seconds: f64) {
        self.stopwatch_time = Some(seconds);
    }

    // ── settings ────────────────────────────────────────────

    pub fn error_ignore(&self) -> bool {
        self.system
            .get("!ERRORIGNORE")
            .map_or(false, |v| v.eq_ignore_ascii_case("YES") || v.eq_ignore_ascii_case("TRUE"))
    }

    /// A numeric system setting in seconds, if set and valid.
    pub fn seconds(&self, name: &str) -> Option<f64> {
        self.system
            .get(&canonical(name))
            .and_then(|v| crate::value::parse_number(v))
            .filter(|s| *s >= 0.0)
    }

    /// User variables in first-write order.
    pub fn user_vars(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.user.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl VariableSource for VariableStore {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name)
    }
}

fn canonical(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

fn slot_index(key: &str) -> Option<usize> {
    let digit = key.strip_prefix("!VAR")?;
    match digit.as_bytes() {
        [d @ b'0'..=b'9'] => Some((d - b'0') as usize),
        _ => None,
    }
}

fn col_index(key: &str) -> Option<usize> {
    let n: usize = key.strip_prefix("!COL")?.parse().ok()?;
    (1..=MIRRORED_COLUMNS).contains(&n).then_some(n)
}

fn is_read_only(key: &str) -> bool {
    matches!(
        key,
        "!LOOP" | "!DATASOURCE" | "!DATASOURCE_LINE" | "!DATASOURCE_COLUMNS" | "!STOPWATCHTIME"
    ) || key.starts_with("!NOW:")
        || key.starts_with("!COL")
}

/// Render the current local time with `!NOW` tokens
/// (`yyyy yy mm dd hh nn ss dow doy`, case-insensitive).
fn format_now(fmt: &str) -> String {
    let now = Local::now();
    let mut out = String::new();
    let mut rest = fmt;
    while !rest.is_empty() {
        let upper = rest.to_ascii_uppercase();
        let (text, used) = if upper.starts_with("YYYY") {
            (format!("{:04}", now.year()), 4)
        } else if upper.starts_with("DOW") {
            (now.weekday().number_from_monday().to_string(), 3)
        } else if upper.starts_with("DOY") {
            (now.ordinal().to_string(), 3)
        } else if upper.starts_with("YY") {
            (format!("{:02}", now.year() % 100), 2)
        } else if upper.starts_with("MM") {
            (format!("{:02}", now.month()), 2)
        } else if upper.starts_with("DD") {
            (format!("{:02}", now.day()), 2)
        } else if upper.starts_with("HH") {
            (format!("{:02}", now.hour()), 2)
        } else if upper.starts_with("NN") {
            (format!("{:02}", now.minute()), 2)
        } else if upper.starts_with("SS") {
            (format!("{:02}", now.second()), 2)
        } else {
            let c = rest.chars().next().map_or(1, char::len_utf8);
            (rest[..c].to_string(), c)
        };
        out.push_str(&text);
        rest = &rest[used..];
    }
    out
}
