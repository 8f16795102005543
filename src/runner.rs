//! Macro file runner
//!
//! Discovers `.iim` files under a directory, parses and plays each one
//! with a fresh session, and reports results.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::control::PlaybackControl;
use crate::engine::Engine;
use crate::parser::parse_macro;
use crate::session::{RunStatus, Session};

/// Configuration for the runner
pub struct RunConfig {
    /// Directory (or single file) containing macros
    pub dir: PathBuf,
    /// Only run macros whose file stem contains this string
    pub filter: Option<String>,
    /// Setup hook called on each fresh session before it plays
    pub setup: Option<Box<dyn Fn(&mut Session) + Send + Sync>>,
    /// Keep the transcript of passing macros too
    pub verbose: bool,
    /// File extensions to scan (default: [".iim"])
    pub extensions: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("macros"),
            filter: None,
            setup: None,
            verbose: false,
            extensions: vec![".iim".into()],
        }
    }
}

/// Result of running every discovered macro
#[derive(Debug)]
pub struct RunResult {
    pub cases: Vec<MacroCaseResult>,
    pub duration: Duration,
}

impl RunResult {
    pub fn all_passed(&self) -> bool {
        self.cases.iter().all(|c| c.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.cases.iter().filter(|c| c.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.cases.iter().filter(|c| !c.passed).count()
    }

    /// Format a summary line
    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} failed ({}ms)",
            self.passed_count(),
            self.failed_count(),
            self.duration.as_millis(),
        )
    }
}

/// Result of a single macro file
#[derive(Debug)]
pub struct MacroCaseResult {
    /// File stem
    pub name: String,
    pub file: PathBuf,
    /// Whether the run reached `Completed`
    pub passed: bool,
    /// Final status; `None` when the file could not be read or parsed
    pub status: Option<RunStatus>,
    pub error: Option<String>,
    /// Run transcript (empty for passing macros unless verbose)
    pub log: String,
    pub extracts: Vec<String>,
    pub duration: Duration,
}

impl MacroCaseResult {
    fn load_failure(name: String, file: &Path, error: String, start: Instant) -> Self {
        Self {
            name,
            file: file.to_path_buf(),
            passed: false,
            status: None,
            error: Some(error),
            log: String::new(),
            extracts: Vec::new(),
            duration: start.elapsed(),
        }
    }
}

/// Plays macro files through an [`Engine`]
pub struct MacroRunner {
    engine: Engine,
    config: RunConfig,
}

impl MacroRunner {
    /// Create a runner with a default engine (built-ins only)
    pub fn new(config: RunConfig) -> Self {
        Self {
            engine: Engine::default(),
            config,
        }
    }

    pub fn with_engine(engine: Engine, config: RunConfig) -> Self {
        Self { engine, config }
    }

    /// Mutable access to the engine, for registering handlers
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Discover macro files in the configured directory, sorted by path.
    pub fn discover(&self) -> anyhow::Result<Vec<PathBuf>> {
        let dir = &self.config.dir;
        if !dir.exists() {
            anyhow::bail!("macro directory not found: {}", dir.display());
        }
        if dir.is_file() {
            return Ok(vec![dir.clone()]);
        }

        let mut files = Vec::new();
        self.scan_dir(dir, &mut files)
            .with_context(|| format!("failed to scan {}", dir.display()))?;
        files.sort();
        Ok(files)
    }

    fn scan_dir(&self, dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.scan_dir(&path, files)?;
            } else if self.is_macro_file(&path) && self.matches_filter(&path) {
                files.push(path);
            }
        }
        Ok(())
    }

    fn is_macro_file(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |name| {
                let name = name.to_ascii_lowercase();
                self.config
                    .extensions
                    .iter()
                    .any(|ext| name.ends_with(&ext.to_ascii_lowercase()))
            })
    }

    fn matches_filter(&self, path: &Path) -> bool {
        match &self.config.filter {
            Some(filter) => stem(path).contains(filter.as_str()),
            None => true,
        }
    }

    /// Play every discovered macro.
    pub async fn run_all(&self) -> anyhow::Result<RunResult> {
        let start = Instant::now();
        let files = self.discover()?;

        let mut cases = Vec::with_capacity(files.len());
        for file in &files {
            cases.push(self.run_one(file).await);
        }
        Ok(RunResult {
            cases,
            duration: start.elapsed(),
        })
    }

    /// Play a single macro file.
    pub async fn run_one(&self, file: &Path) -> MacroCaseResult {
        let start = Instant::now();
        let name = stem(file).to_string();

        let source = match tokio::fs::read_to_string(file).await {
            Ok(s) => s,
            Err(e) => {
                return MacroCaseResult::load_failure(
                    name,
                    file,
                    format!("failed to read file: {}", e),
                    start,
                )
            }
        };
        let mac = match parse_macro(&source) {
            Ok(m) => m,
            Err(e) => return MacroCaseResult::load_failure(name, file, e.to_string(), start),
        };

        let mut session = Session::new();
        if let Some(setup) = &self.config.setup {
            setup(&mut session);
        }
        let report = self
            .engine
            .play(&mac, &mut session, &PlaybackControl::new())
            .await;

        let passed = report.succeeded();
        let error = if passed {
            None
        } else {
            Some(
                report
                    .last_error
                    .as_ref()
                    .map_or_else(|| format!("run {}", report.status), |e| e.to_string()),
            )
        };
        let log = if passed && !self.config.verbose {
            String::new()
        } else {
            session.log.as_str().to_string()
        };

        MacroCaseResult {
            name,
            file: file.to_path_buf(),
            passed,
            status: Some(report.status),
            error,
            log,
            extracts: report.extracts,
            duration: start.elapsed(),
        }
    }
}

fn stem(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("unknown")
}

/// Builder API for convenient runner construction
pub struct RunnerBuilder {
    config: RunConfig,
    engine: Option<Engine>,
}

impl RunnerBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            config: RunConfig {
                dir: dir.into(),
                ..Default::default()
            },
            engine: None,
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.config.filter = Some(filter.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    pub fn extensions(mut self, exts: Vec<String>) -> Self {
        self.config.extensions = exts;
        self
    }

    pub fn setup(mut self, f: impl Fn(&mut Session) + Send + Sync + 'static) -> Self {
        self.config.setup = Some(Box::new(f));
        self
    }

    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> MacroRunner {
        match self.engine {
            Some(engine) => MacroRunner::with_engine(engine, self.config),
            None => MacroRunner::new(self.config),
        }
    }

    pub async fn run(self) -> anyhow::Result<RunResult> {
        self.build().run_all().await
    }
}

/// Convenience function: create a runner builder for a directory
pub fn run(dir: impl Into<PathBuf>) -> RunnerBuilder {
    RunnerBuilder::new(dir)
}

/// Play macro files and panic if any fails, for use from async tests.
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn macros() {
///     imacro_core::run_and_assert("tests/macros").await;
/// }
/// ```
pub async fn run_and_assert(dir: impl Into<PathBuf>) {
    run_and_assert_with(dir, |_| {}).await;
}

/// Like `run_and_assert` but allows engine customization.
pub async fn run_and_assert_with(dir: impl Into<PathBuf>, customize: impl FnOnce(&mut Engine)) {
    let mut engine = Engine::default();
    customize(&mut engine);

    let config = RunConfig {
        dir: dir.into(),
        verbose: std::env::var("IMACRO_VERBOSE").is_ok(),
        ..Default::default()
    };
    let runner = MacroRunner::with_engine(engine, config);
    let result = match runner.run_all().await {
        Ok(r) => r,
        Err(e) => panic!("failed to run macros: {:#}", e),
    };

    for case in &result.cases {
        if case.passed {
            eprintln!("PASS  {} ({}ms)", case.name, case.duration.as_millis());
        } else {
            eprintln!("FAIL  {}", case.name);
            if let Some(ref err) = case.error {
                eprintln!("  {}", err);
            }
        }
        if !case.log.is_empty() {
            eprintln!("  --- log ---");
            for line in case.log.lines() {
                eprintln!("  {}", line);
            }
        }
    }

    eprintln!("\n{}", result.summary());

    if !result.all_passed() {
        panic!("{} macro(s) failed", result.failed_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_discover_sorted_and_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "b_login.iim", "SET !VAR1 1\n");
        write(tmp.path(), "nested/a_search.IIM", "SET !VAR1 1\n");
        write(tmp.path(), "notes.txt", "not a macro\n");

        let runner = run(tmp.path()).build();
        let files = runner.discover().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("b_login.iim"));
        assert!(files[1].ends_with("nested/a_search.IIM"));

        let runner = run(tmp.path()).filter("search").build();
        assert_eq!(runner.discover().unwrap().len(), 1);

        assert!(run(tmp.path().join("missing")).build().discover().is_err());
    }

    #[tokio::test]
    async fn test_run_all_reports_each_file() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "ok.iim", "SET !VAR1 {{2*3}}\nADD !EXTRACT {{!VAR1}}\n");
        write(tmp.path(), "broken.iim", "BOGUS X=1\n");
        write(tmp.path(), "unhandled.iim", "URL GOTO=https://example.com\n");

        let result = run(tmp.path()).run().await.unwrap();
        assert_eq!(result.cases.len(), 3);
        assert_eq!(result.passed_count(), 1);
        assert!(result.summary().starts_with("1 passed, 2 failed"));

        let by_name = |n: &str| result.cases.iter().find(|c| c.name == n).unwrap();
        assert_eq!(by_name("ok").extracts, vec!["6".to_string()]);
        assert_eq!(by_name("broken").status, None);
        let unhandled = by_name("unhandled");
        assert_eq!(unhandled.status, Some(RunStatus::Failed));
        assert!(unhandled.error.as_deref().unwrap().contains("-901"));
        assert!(unhandled.log.contains("> URL GOTO=https://example.com"));
    }

    #[tokio::test]
    async fn test_setup_hook_seeds_session() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "seeded.iim", "ADD !EXTRACT {{!VAR5}}\n");
        let result = run(tmp.path())
            .setup(|s| s.vars.set("!VAR5", "seed").unwrap())
            .run()
            .await
            .unwrap();
        assert_eq!(result.cases[0].extracts, vec!["seed".to_string()]);
    }
}
