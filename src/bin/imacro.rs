//! imacro CLI
//!
//! Check, format and dry-run macro files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use imacro_core::{
    canonical_diff, default_builtins, parse_macro, CommandHandler, CommandKind, CommandResult,
    Engine, HandlerContext, MacroRunner, PlaybackControl, PlayerConfig, Repeat, RunConfig,
    Session, TimeoutClass,
};

#[derive(Parser, Debug)]
#[command(name = "imacro")]
#[command(version)]
#[command(about = "Check, format and dry-run browser automation macros")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play a macro file, or every macro under a directory, against
    /// handlers that only log
    Run {
        path: PathBuf,

        /// Player configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Play the macro N times
        #[arg(long = "loop", value_name = "N", conflicts_with = "datasource_loop")]
        loop_count: Option<u64>,

        /// Play once per datasource row
        #[arg(long)]
        datasource_loop: bool,

        /// Start with !ERRORIGNORE YES
        #[arg(long)]
        error_ignore: bool,

        /// Handlers return CONTENT (or the SEARCH pattern) as extracted text
        #[arg(long)]
        extract_echo: bool,

        /// Values for CMDLINE (VAR=VALUE)
        #[arg(short = 'D', long = "var", value_name = "VAR=VALUE")]
        vars: Vec<String>,

        /// Read stdin while playing: Enter resumes a pause, `q` stops
        #[arg(short, long)]
        interactive: bool,
    },

    /// Parse a macro and report the first syntax error
    Check { file: PathBuf },

    /// Rewrite a macro in canonical form
    Fmt {
        file: PathBuf,

        /// Print a diff and fail instead of rewriting
        #[arg(long)]
        check: bool,
    },

    /// List the command vocabulary
    Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Run {
            path,
            config,
            loop_count,
            datasource_loop,
            error_ignore,
            extract_echo,
            vars,
            interactive,
        } => {
            let opts = RunOpts {
                config,
                loop_count,
                datasource_loop,
                error_ignore,
                extract_echo,
                vars,
                interactive,
            };
            run(&path, opts).await
        }
        Command::Check { file } => check(&file),
        Command::Fmt { file, check } => fmt(&file, check),
        Command::Commands => {
            print_commands();
            Ok(true)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

// ──────────────────────────────────────────────────────────
// run
// ──────────────────────────────────────────────────────────

struct RunOpts {
    config: Option<PathBuf>,
    loop_count: Option<u64>,
    datasource_loop: bool,
    error_ignore: bool,
    extract_echo: bool,
    vars: Vec<String>,
    interactive: bool,
}

impl RunOpts {
    fn player_config(&self) -> anyhow::Result<PlayerConfig> {
        let mut config = match &self.config {
            Some(path) => PlayerConfig::load(path)?,
            None => PlayerConfig::default(),
        };
        if let Some(n) = self.loop_count {
            config.repeat = Repeat::Times(n);
        }
        if self.datasource_loop {
            config.repeat = Repeat::UntilDatasourceEnd;
        }
        if self.error_ignore {
            config.error_ignore = true;
        }
        for pair in &self.vars {
            let (var, value) = pair
                .split_once('=')
                .with_context(|| format!("expected VAR=VALUE, got {:?}", pair))?;
            config.cmdline.insert(var.to_string(), value.to_string());
        }
        Ok(config)
    }
}

/// Stand-in for a browser: logs each host command and succeeds.
struct DryRunHandler {
    extract_echo: bool,
}

#[async_trait]
impl CommandHandler for DryRunHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>) -> CommandResult {
        let args: Vec<String> = ctx
            .params()
            .iter()
            .map(|p| format!("{}={}", p.key, p.value))
            .collect();
        ctx.log(&format!("[host] {} {}", ctx.kind, args.join(" ")));

        let mut result = CommandResult::ok();
        if self.extract_echo && ctx.action.extracts() {
            let echoed = ctx
                .param("CONTENT")
                .or_else(|| ctx.param("SOURCE"))
                .unwrap_or_default()
                .to_string();
            result = result.with_output(echoed);
        }
        result
    }
}

async fn run(path: &Path, opts: RunOpts) -> anyhow::Result<bool> {
    let mut engine = Engine::new(opts.player_config()?);
    for kind in CommandKind::ALL {
        if !kind.is_builtin() {
            engine.register(
                kind,
                Box::new(DryRunHandler {
                    extract_echo: opts.extract_echo,
                }),
            );
        }
    }

    if path.is_dir() {
        let runner = MacroRunner::with_engine(
            engine,
            RunConfig {
                dir: path.to_path_buf(),
                verbose: true,
                ..Default::default()
            },
        );
        let result = runner.run_all().await?;
        for case in &result.cases {
            if case.passed {
                println!("PASS  {} ({}ms)", case.name, case.duration.as_millis());
            } else {
                println!("FAIL  {}", case.name);
                if let Some(ref err) = case.error {
                    println!("      {}", err);
                }
            }
            for line in case.log.lines() {
                println!("      {}", line);
            }
        }
        println!();
        println!("{}", result.summary());
        return Ok(result.all_passed());
    }

    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mac = parse_macro(&source).with_context(|| format!("failed to parse {}", path.display()))?;

    let control = PlaybackControl::new();
    if opts.interactive {
        spawn_console(control.clone());
    }
    let mut session = Session::new();
    let report = engine.play(&mac, &mut session, &control).await;

    print!("{}", session.log.as_str());
    for (i, extract) in report.extracts.iter().enumerate() {
        println!("extract[{}]: {}", i + 1, extract);
    }
    println!(
        "{} after {} iteration(s) ({}ms)",
        report.status,
        report.iterations,
        report.duration.as_millis()
    );
    if let Some(ref err) = report.last_error {
        println!("last error: {}", err);
    }
    Ok(report.succeeded())
}

/// Drive pause/resume/stop from stdin.
fn spawn_console(control: PlaybackControl) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "q" | "quit" | "stop" => {
                    control.stop();
                    break;
                }
                "p" | "pause" => control.pause(),
                _ => control.resume(),
            }
        }
    });
}

// ──────────────────────────────────────────────────────────
// check / fmt
// ──────────────────────────────────────────────────────────

fn check(file: &Path) -> anyhow::Result<bool> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    match parse_macro(&source) {
        Ok(mac) => {
            println!("{}: ok, {} command(s)", file.display(), mac.commands.len());
            Ok(true)
        }
        Err(e) => {
            println!("{}:{}: {}", file.display(), e.line, e.message);
            Ok(false)
        }
    }
}

fn fmt(file: &Path, check_only: bool) -> anyhow::Result<bool> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let name = file.display().to_string();
    let Some(diff) = canonical_diff(&name, &source)? else {
        return Ok(true);
    };
    if check_only {
        print!("{}", diff);
        return Ok(false);
    }
    let canonical = parse_macro(&source)?.to_source();
    std::fs::write(file, canonical).with_context(|| format!("failed to write {}", name))?;
    println!("formatted {}", name);
    Ok(true)
}

// ──────────────────────────────────────────────────────────
// commands
// ──────────────────────────────────────────────────────────

fn print_commands() {
    let builtins = default_builtins();

    println!("Interpreter commands:");
    println!();
    let mut owned: Vec<_> = builtins.iter().collect();
    owned.sort_by_key(|(kind, _)| **kind);
    for (kind, cmd) in owned {
        let usage = cmd.usage();
        println!("  {:<12} {:<36} {}", kind.keyword(), usage.args, usage.summary);
    }

    println!();
    println!("Host commands:");
    println!();
    for kind in CommandKind::ALL.iter().filter(|k| !k.is_builtin()) {
        let timeout = match kind.timeout_class() {
            TimeoutClass::Step => "retried within !TIMEOUT_STEP",
            TimeoutClass::Page => "retried within !TIMEOUT_PAGE",
            TimeoutClass::None => "not retried",
        };
        println!("  {:<12} {}", kind.keyword(), timeout);
    }
}
