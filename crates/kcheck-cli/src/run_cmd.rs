//! `kcheck run` and `kcheck exec`: build a plan, run it, print the report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use kcheck_core::report::Report;
use kcheck_core::script::{self, ScriptToml, SessionToml, TransportKind, TurnToml};
use kcheck_core::session::runner::{self, Plan};

use crate::Format;
use crate::config::{KcheckConfig, TimeoutArgs};

/// Inputs of a single ad hoc turn.
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    pub code: String,
    pub expect: Option<String>,
    pub console: Option<String>,
    pub connection: Option<PathBuf>,
    pub preset: Option<String>,
    pub marker: Option<String>,
    pub init_phrase: Option<String>,
    pub check_echo: bool,
    pub startup_settle: bool,
}

impl ExecArgs {
    /// The one-turn script equivalent to these arguments.
    pub fn to_script(&self) -> ScriptToml {
        let transport = if self.console.is_some() {
            Some(TransportKind::Console)
        } else if self.connection.is_some() {
            Some(TransportKind::Channel)
        } else {
            None
        };
        ScriptToml {
            session: SessionToml {
                preset: self.preset.clone(),
                transport,
                command: self.console.clone(),
                connection_file: self.connection.clone(),
                marker: self.marker.clone(),
                init_phrase: self.init_phrase.clone(),
                startup_settle: self.startup_settle,
                check_echo: self.check_echo.then_some(true),
                ..SessionToml::default()
            },
            turns: vec![TurnToml {
                label: None,
                code: self.code.clone(),
                expect: self.expect.clone(),
                check_echo: None,
                check_payloads: true,
            }],
        }
    }
}

/// Run a check script file; returns the process exit code.
pub async fn run_script(path: &Path, format: Format, timeouts: &TimeoutArgs) -> Result<i32> {
    let script = script::load_script(path)?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    let plan = script::build_plan(&script, base_dir)
        .with_context(|| format!("failed to prepare {}", path.display()))?;
    execute(&plan, format, timeouts).await
}

/// Run one ad hoc turn; returns the process exit code.
pub async fn run_exec(args: ExecArgs, format: Format, timeouts: &TimeoutArgs) -> Result<i32> {
    let script = args.to_script();
    script::validate_script(&script)?;
    let plan = script::build_plan(&script, Path::new("."))?;
    execute(&plan, format, timeouts).await
}

async fn execute(plan: &Plan, format: Format, timeouts: &TimeoutArgs) -> Result<i32> {
    let config = KcheckConfig::resolve(timeouts)?;
    tracing::info!(kernel = %plan.target.describe(), turns = plan.turns.len(), "running plan");
    let report = runner::execute(plan, &config.session).await;
    print_report(&report, format)?;
    Ok(report.exit_code())
}

fn print_report(report: &Report, format: Format) -> Result<()> {
    match format {
        Format::Text => print!("{}", report.render_text()),
        Format::Json => println!("{}", report.to_json().context("failed to serialize report")?),
    }
    Ok(())
}
