//! Datasource commands: DS, and the `!DATASOURCE*` assignments behind SET

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use super::{mismatch, Builtin, BuiltinEnv, BuiltinUsage, Flow};
use crate::command::{Action, CommandKind, DsCommand};
use crate::datasource::{Datasource, DatasourceOptions};
use crate::error::{ErrorCode, MacroError};
use crate::session::Session;

// ──────────────────────────────────────────────────────────
// DS: move the datasource cursor
// ──────────────────────────────────────────────────────────

pub(super) struct DsCmd;

#[async_trait]
impl Builtin for DsCmd {
    async fn run(&self, env: &mut BuiltinEnv<'_>, action: &Action) -> Result<Flow, MacroError> {
        let Action::Ds(cmd) = action else {
            return Err(mismatch(CommandKind::Ds, action));
        };
        let session = &mut *env.session;
        if *cmd == DsCommand::Clear {
            session.detach_datasource();
            return Ok(Flow::Continue);
        }

        let ds = session.datasource.as_mut().ok_or_else(no_datasource)?;
        let moved = match cmd {
            DsCommand::Next => ds.next(),
            DsCommand::Previous => ds.previous(),
            DsCommand::Reset => ds.reset(),
            DsCommand::Clear => true,
        };
        if !moved {
            return Err(MacroError::new(
                ErrorCode::DatasourceEnd,
                format!("no row {} line {}", direction(cmd), ds.current_line()),
            ));
        }
        session.sync_datasource();
        Ok(Flow::Continue)
    }

    fn usage(&self) -> BuiltinUsage {
        BuiltinUsage {
            summary: "Move the datasource cursor",
            args: "CMD=NEXT|PREVIOUS|RESET|CLEAR",
        }
    }
}

fn direction(cmd: &DsCommand) -> &'static str {
    match cmd {
        DsCommand::Previous => "before",
        _ => "after",
    }
}

fn no_datasource() -> MacroError {
    MacroError::new(ErrorCode::DatasourceError, "no datasource loaded")
}

// ──────────────────────────────────────────────────────────
// SET !DATASOURCE / SET !DATASOURCE_LINE
// ──────────────────────────────────────────────────────────

/// Load `name` through the host's datasource provider. Naming the file
/// that is already loaded keeps its cursor; an empty name or `NULL`
/// unloads it.
pub(super) async fn load(env: &mut BuiltinEnv<'_>, name: &str) -> Result<(), MacroError> {
    let name = name.trim();
    if name.is_empty() || name.eq_ignore_ascii_case("NULL") {
        env.session.detach_datasource();
        return Ok(());
    }
    if env.session.datasource.as_ref().map(Datasource::name) == Some(name) {
        env.session.sync_datasource();
        return Ok(());
    }

    let folder = env.session.vars.get_text("!FOLDER_DATASOURCE");
    let path = if folder.is_empty() || Path::new(name).is_absolute() {
        name.to_string()
    } else {
        Path::new(&folder).join(name).to_string_lossy().into_owned()
    };
    let text = env.datasources.read(&path).await?;

    let options = DatasourceOptions {
        delimiter: DatasourceOptions::delimiter_from_setting(
            &env.session.vars.get_text("!DATASOURCE_DELIMITER"),
        ),
        ..DatasourceOptions::default()
    };
    let ds = Datasource::load(name, &text, &options)?;
    info!(datasource = name, rows = ds.row_count(), columns = ds.column_count(), "datasource loaded");
    env.session
        .logf(&format!("[datasource] {}: {} rows", name, ds.row_count()));
    env.session.attach_datasource(ds);
    Ok(())
}

/// Move the cursor to a 1-based line.
pub(super) fn goto_line(session: &mut Session, value: &str) -> Result<(), MacroError> {
    let line: usize = value
        .trim()
        .parse()
        .map_err(|_| MacroError::invalid("!DATASOURCE_LINE", value, "a line number"))?;
    let ds = session.datasource.as_mut().ok_or_else(no_datasource)?;
    if !ds.goto_row(line) {
        return Err(MacroError::new(
            ErrorCode::DatasourceEnd,
            format!("line {} is outside the {} rows of {}", line, ds.row_count(), ds.name()),
        ));
    }
    session.sync_datasource();
    Ok(())
}
