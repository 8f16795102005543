//! Datasource cursor
//!
//! Loads delimited text into a rectangular row set and walks it one row
//! per loop iteration. The current row is mirrored into the variable
//! store as `!COL1`..`!COL10`, `!DATASOURCE` and `!DATASOURCE_LINE`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{ErrorCode, MacroError};
use crate::vars::{DatasourceView, VariableStore, MIRRORED_COLUMNS};

/// Delimiters considered by auto-detection, in tie-break order
const CANDIDATES: [u8; 4] = [b',', b'\t', b';', b'|'];

/// Lines sampled by auto-detection
const SAMPLE_LINES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatasourceError {
    #[error("datasource {0} has no rows")]
    Empty(String),
    #[error("start line {start} is beyond the {rows} rows of {name}")]
    StartBeyondEnd {
        name: String,
        start: usize,
        rows: usize,
    },
    #[error("malformed datasource {name}: {source}")]
    Csv {
        name: String,
        #[source]
        source: csv::Error,
    },
}

/// How to read a datasource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasourceOptions {
    /// Field delimiter; `None` auto-detects
    pub delimiter: Option<u8>,
    /// Treat the first row as column names
    pub has_header: bool,
    /// 1-based data row the cursor starts on (and resets to)
    pub start_line: usize,
}

impl Default for DatasourceOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            has_header: false,
            start_line: 1,
        }
    }
}

impl DatasourceOptions {
    /// Parse the `!DATASOURCE_DELIMITER` setting: a single character or
    /// one of the names `TAB`, `COMMA`, `SEMICOLON`, `PIPE`.
    pub fn delimiter_from_setting(setting: &str) -> Option<u8> {
        match setting.trim().to_ascii_uppercase().as_str() {
            "" => None,
            "TAB" | "\\T" => Some(b'\t'),
            "COMMA" => Some(b','),
            "SEMICOLON" => Some(b';'),
            "PIPE" => Some(b'|'),
            s if s.len() == 1 => s.bytes().next(),
            _ => None,
        }
    }
}

/// A loaded row set with a cursor
#[derive(Debug, Clone)]
pub struct Datasource {
    name: String,
    headers: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
    column_count: usize,
    delimiter: u8,
    start: usize,
    current: usize,
}

impl Datasource {
    /// Parse `text` into a datasource named `name`.
    pub fn load(
        name: impl Into<String>,
        text: &str,
        options: &DatasourceOptions,
    ) -> Result<Self, DatasourceError> {
        let name = name.into();
        if text.trim().is_empty() {
            return Err(DatasourceError::Empty(name));
        }

        let delimiter = options.delimiter.unwrap_or_else(|| detect_delimiter(text));
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|source| DatasourceError::Csv {
                name: name.clone(),
                source,
            })?;
            rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        let headers = if options.has_header && !rows.is_empty() {
            Some(rows.remove(0))
        } else {
            None
        };
        if rows.is_empty() {
            return Err(DatasourceError::Empty(name));
        }

        let column_count = rows
            .iter()
            .map(Vec::len)
            .chain(headers.iter().map(Vec::len))
            .max()
            .unwrap_or(0);
        for row in &mut rows {
            row.resize(column_count, String::new());
        }

        let start_line = options.start_line.max(1);
        if start_line > rows.len() {
            return Err(DatasourceError::StartBeyondEnd {
                name,
                start: start_line,
                rows: rows.len(),
            });
        }

        Ok(Self {
            name,
            headers,
            rows,
            column_count,
            delimiter,
            start: start_line - 1,
            current: start_line - 1,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.column_count
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    /// 1-based line of the current row
    pub fn current_line(&self) -> usize {
        self.current + 1
    }

    pub fn current_row(&self) -> &[String] {
        &self.rows[self.current]
    }

    pub fn has_next(&self) -> bool {
        self.current + 1 < self.rows.len()
    }

    // ── navigation ──────────────────────────────────────────

    /// Move to the next row. Fails without moving at the last row.
    pub fn next(&mut self) -> bool {
        if !self.has_next() {
            return false;
        }
        self.current += 1;
        true
    }

    /// Move to the previous row. Fails without moving at the first row.
    pub fn previous(&mut self) -> bool {
        if self.current == 0 {
            return false;
        }
        self.current -= 1;
        true
    }

    /// Jump to a 1-based row. Out-of-range rows fail without moving.
    pub fn goto_row(&mut self, line: usize) -> bool {
        if line == 0 || line > self.rows.len() {
            return false;
        }
        self.current = line - 1;
        true
    }

    /// Return to the start line.
    pub fn reset(&mut self) -> bool {
        self.current = self.start;
        true
    }

    // ── column access ───────────────────────────────────────

    /// 1-based field of the current row; `""` when out of range.
    pub fn column(&self, index: usize) -> &str {
        if index == 0 {
            return "";
        }
        self.current_row()
            .get(index - 1)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Field of the current row under the header `name` (case-insensitive).
    pub fn column_by_name(&self, name: &str) -> Option<&str> {
        let headers = self.headers.as_ref()?;
        let idx = headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name))?;
        Some(self.column(idx + 1))
    }

    // ── variable mirror ─────────────────────────────────────

    pub fn view(&self) -> DatasourceView {
        let row = self.current_row();
        DatasourceView {
            name: self.name.clone(),
            line: self.current_line(),
            columns: self.column_count,
            fields: (1..=MIRRORED_COLUMNS)
                .map(|i| row.get(i - 1).cloned().unwrap_or_default())
                .collect(),
        }
    }

    /// Mirror the current row into `store`.
    pub fn populate_variables(&self, store: &mut VariableStore) {
        store.set_datasource_view(Some(self.view()));
    }

    /// Reset the mirror for a run without a datasource.
    pub fn clear_variables(store: &mut VariableStore) {
        store.set_datasource_view(None);
    }
}

/// Pick the candidate delimiter that splits the sampled lines most
/// consistently: highest minimum per-line count, then highest total.
/// Falls back to comma.
pub fn detect_delimiter(text: &str) -> u8 {
    let sample: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SAMPLE_LINES)
        .collect();

    let mut best = (b',', 0usize, 0usize);
    for &delim in &CANDIDATES {
        let counts: Vec<usize> = sample.iter().map(|l| count_unquoted(l, delim)).collect();
        let min = counts.iter().copied().min().unwrap_or(0);
        let total: usize = counts.iter().sum();
        if min == 0 && total == 0 {
            continue;
        }
        if (min, total) > (best.1, best.2) {
            best = (delim, min, total);
        }
    }
    best.0
}

fn count_unquoted(line: &str, delim: u8) -> usize {
    let mut in_quotes = false;
    let mut n = 0;
    for b in line.bytes() {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if b == delim && !in_quotes {
            n += 1;
        }
    }
    n
}

/// Where `SET !DATASOURCE <name>` reads its text from
#[async_trait]
pub trait DatasourceProvider: Send + Sync {
    async fn read(&self, name: &str) -> Result<String, MacroError>;
}

/// Reads datasources from disk, resolving relative names against a base
/// directory.
#[derive(Debug, Clone)]
pub struct FsDatasourceProvider {
    base: PathBuf,
}

impl FsDatasourceProvider {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        let p = Path::new(name);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base.join(p)
        }
    }
}

#[async_trait]
impl DatasourceProvider for FsDatasourceProvider {
    async fn read(&self, name: &str) -> Result<String, MacroError> {
        let path = self.resolve(name);
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            let code = match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::FileAccessDenied,
                _ => ErrorCode::DatasourceError,
            };
            MacroError::new(code, format!("cannot read datasource {}: {}", path.display(), e))
        })
    }
}

/// Serves datasources from memory, keyed by name
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatasources {
    files: HashMap<String, String>,
}

impl InMemoryDatasources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.files.insert(name.into(), text.into());
        self
    }
}

#[async_trait]
impl DatasourceProvider for InMemoryDatasources {
    async fn read(&self, name: &str) -> Result<String, MacroError> {
        self.files.get(name).cloned().ok_or_else(|| {
            MacroError::new(ErrorCode::FileNotFound, format!("no datasource named {}", name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> Datasource {
        Datasource::load("test.csv", text, &DatasourceOptions::default()).unwrap()
    }

    #[test]
    fn test_rectangularized_rows() {
        let ds = load("a,b,c\nd\ne,f\n");
        assert_eq!(ds.row_count(), 3);
        assert_eq!(ds.column_count(), 3);
        assert_eq!(ds.column(1), "a");
        assert_eq!(ds.column(3), "c");
        assert_eq!(ds.column(4), "");
        assert_eq!(ds.column(0), "");
    }

    #[test]
    fn test_iteration_visits_every_row_in_order() {
        let mut ds = load("1\n2\n3\n4\n");
        let mut seen = vec![ds.column(1).to_string()];
        while ds.next() {
            seen.push(ds.column(1).to_string());
        }
        assert_eq!(seen, vec!["1", "2", "3", "4"]);
        // past the end is a no-op
        assert!(!ds.next());
        assert_eq!(ds.current_line(), 4);
    }

    #[test]
    fn test_navigation_bounds() {
        let mut ds = load("a\nb\nc");
        assert!(!ds.previous());
        assert!(ds.goto_row(3));
        assert_eq!(ds.column(1), "c");
        assert!(!ds.goto_row(4));
        assert!(!ds.goto_row(0));
        assert_eq!(ds.current_line(), 3);
        assert!(ds.previous());
        assert_eq!(ds.column(1), "b");
        assert!(ds.reset());
        assert_eq!(ds.current_line(), 1);
    }

    #[test]
    fn test_populate_then_advance() {
        let mut ds = load("a,b\nc,d");
        let mut vars = VariableStore::new();
        ds.populate_variables(&mut vars);
        assert_eq!(vars.get_text("!COL1"), "a");
        assert!(ds.next());
        ds.populate_variables(&mut vars);
        assert_eq!(vars.get_text("!COL1"), "c");
        assert_eq!(vars.get_text("!COL2"), "d");
        assert_eq!(vars.get_text("!COL3"), "");
        assert_eq!(vars.get_text("!DATASOURCE_LINE"), "2");
        assert_eq!(vars.get_text("!DATASOURCE"), "test.csv");

        Datasource::clear_variables(&mut vars);
        assert_eq!(vars.get("!COL1"), None);
        assert_eq!(vars.get_text("!DATASOURCE_LINE"), "0");
    }

    #[test]
    fn test_delimiter_detection() {
        assert_eq!(detect_delimiter("a;b;c\nd;e;f"), b';');
        assert_eq!(detect_delimiter("a\tb\nc\td"), b'\t');
        assert_eq!(detect_delimiter("a|b\nc|d"), b'|');
        assert_eq!(detect_delimiter("\"x,y\";z\n\"1,2\";3"), b';');
        assert_eq!(detect_delimiter("single"), b',');
        let ds = load("x;y\n1;2");
        assert_eq!(ds.column(2), "y");
    }

    #[test]
    fn test_header_and_start_line() {
        let opts = DatasourceOptions {
            delimiter: Some(b','),
            has_header: true,
            start_line: 2,
        };
        let mut ds = Datasource::load("people.csv", "Name,Age\nann,31\nbob,42", &opts).unwrap();
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.column_by_name("age"), Some("42"));
        assert!(ds.previous());
        assert!(ds.reset());
        assert_eq!(ds.column(1), "bob");
        assert_eq!(ds.column_by_name("missing"), None);
    }

    #[test]
    fn test_load_failures() {
        let opts = DatasourceOptions::default();
        assert!(matches!(
            Datasource::load("e.csv", "  \n", &opts),
            Err(DatasourceError::Empty(_))
        ));
        let beyond = DatasourceOptions {
            start_line: 5,
            ..DatasourceOptions::default()
        };
        assert!(matches!(
            Datasource::load("s.csv", "a\nb", &beyond),
            Err(DatasourceError::StartBeyondEnd { rows: 2, .. })
        ));
        let header_only = DatasourceOptions {
            has_header: true,
            ..DatasourceOptions::default()
        };
        assert!(matches!(
            Datasource::load("h.csv", "a,b\n", &header_only),
            Err(DatasourceError::Empty(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_provider() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rows.csv"), "a,b\n").unwrap();
        let provider = FsDatasourceProvider::new(dir.path());
        assert_eq!(provider.read("rows.csv").await.unwrap(), "a,b\n");
        let err = provider.read("missing.csv").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::FileNotFound);
    }

    #[test]
    fn test_delimiter_setting_names() {
        assert_eq!(DatasourceOptions::delimiter_from_setting("tab"), Some(b'\t'));
        assert_eq!(DatasourceOptions::delimiter_from_setting(";"), Some(b';'));
        assert_eq!(DatasourceOptions::delimiter_from_setting(""), None);
    }
}
