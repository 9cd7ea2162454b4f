//! Check scripts: a TOML description of one session and its turns.
//!
//! Parses a script into a [`ScriptToml`], validates it, and resolves it into
//! a runnable [`Plan`]. Validation checks:
//! - The script has at least one turn and no turn has blank code.
//! - A marker, init phrase or expected substring, when given, is not blank.
//! - A referenced preset exists.
//! - A transport is chosen, by the script or by its preset.
//! - Console sessions have a command; channel sessions a connection file.

pub mod toml_format;

use std::path::{Path, PathBuf};

use anyhow::Context;
use thiserror::Error;

pub use toml_format::{ScriptToml, SessionToml, TransportKind, TurnToml};

use crate::event::Request;
use crate::presets::{self, KernelPreset};
use crate::session::runner::{Plan, PlannedTurn, Target};
use crate::transport::{ConnectionInfo, ConsoleConfig};
use crate::validate::Expectations;

/// Errors that can occur while loading and validating a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("unknown preset {0:?}")]
    UnknownPreset(String),

    #[error("no transport chosen (set session.transport or session.preset)")]
    MissingTransport,

    #[error("console session needs a command")]
    MissingCommand,

    #[error("channel session needs a connection_file")]
    MissingConnectionFile,

    #[error("turn {0} has no code")]
    EmptyCode(usize),

    /// A blank needle would match every output.
    #[error("{0} is blank")]
    BlankValue(String),

    #[error("script must contain at least one turn")]
    NoTurns,
}

/// Session settings after merging the script over its preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub transport: TransportKind,
    pub command: Option<String>,
    pub connection_file: Option<PathBuf>,
    pub marker: Option<String>,
    pub init_phrase: Option<String>,
    pub terminator: Option<String>,
    pub exit_command: Option<String>,
    pub check_echo: bool,
    pub startup_settle: bool,
}

/// Parse and validate a script string.
pub fn parse_script(content: &str) -> Result<ScriptToml, ScriptError> {
    let script: ScriptToml = toml::from_str(content)?;
    validate_script(&script)?;
    Ok(script)
}

/// Read, parse and validate a script file.
pub fn load_script(path: &Path) -> Result<ScriptToml, ScriptError> {
    let content = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_script(&content)
}

/// Validate a script built in memory or parsed from TOML.
pub fn validate_script(script: &ScriptToml) -> Result<(), ScriptError> {
    if script.turns.is_empty() {
        return Err(ScriptError::NoTurns);
    }
    reject_blank("session.marker", script.session.marker.as_deref())?;
    reject_blank("session.init_phrase", script.session.init_phrase.as_deref())?;
    for (index, turn) in script.turns.iter().enumerate() {
        if turn.code.trim().is_empty() {
            return Err(ScriptError::EmptyCode(index + 1));
        }
        reject_blank(&format!("turn {} expect", index + 1), turn.expect.as_deref())?;
    }
    resolve_session(&script.session)?;
    Ok(())
}

fn reject_blank(what: &str, value: Option<&str>) -> Result<(), ScriptError> {
    match value {
        Some(v) if v.trim().is_empty() => Err(ScriptError::BlankValue(what.to_string())),
        _ => Ok(()),
    }
}

/// Merge the `[session]` table over its preset, if any.
pub fn resolve_session(session: &SessionToml) -> Result<ResolvedSession, ScriptError> {
    let preset: Option<KernelPreset> = match &session.preset {
        Some(name) => Some(
            presets::find_preset(name).ok_or_else(|| ScriptError::UnknownPreset(name.clone()))?,
        ),
        None => None,
    };
    let from_preset = |f: fn(&KernelPreset) -> Option<String>| preset.as_ref().and_then(f);

    let transport = session
        .transport
        .or(preset.as_ref().map(|p| p.transport))
        .ok_or(ScriptError::MissingTransport)?;

    let resolved = ResolvedSession {
        transport,
        command: session
            .command
            .clone()
            .or_else(|| from_preset(|p| Some(p.command.clone()))),
        connection_file: session.connection_file.clone(),
        marker: session.marker.clone().or_else(|| from_preset(|p| p.marker.clone())),
        init_phrase: session
            .init_phrase
            .clone()
            .or_else(|| from_preset(|p| p.init_phrase.clone())),
        terminator: session.terminator.clone(),
        exit_command: session
            .exit_command
            .clone()
            .or_else(|| from_preset(|p| p.exit_command.clone())),
        check_echo: session
            .check_echo
            .or(preset.as_ref().map(|p| p.check_echo))
            .unwrap_or(false),
        startup_settle: session.startup_settle,
    };

    match resolved.transport {
        TransportKind::Console
            if resolved
                .command
                .as_deref()
                .is_none_or(|c| c.trim().is_empty()) =>
        {
            Err(ScriptError::MissingCommand)
        }
        TransportKind::Channel if resolved.connection_file.is_none() => {
            Err(ScriptError::MissingConnectionFile)
        }
        _ => Ok(resolved),
    }
}

impl ResolvedSession {
    /// Checks applied to console startup output.
    pub fn startup_expectations(&self) -> Expectations {
        let mut expectations = Expectations::new();
        expectations.marker = self.marker.clone();
        expectations.init_phrase = self.init_phrase.clone();
        expectations
    }

    /// Build the transport target. Relative connection files are resolved
    /// against `base_dir`.
    pub fn target(&self, base_dir: &Path) -> anyhow::Result<Target> {
        match self.transport {
            TransportKind::Console => {
                let command = self.command.as_deref().unwrap_or_default();
                let mut config = ConsoleConfig::from_command_line(command)
                    .with_context(|| format!("console command {command:?} is empty"))?;
                if let Some(terminator) = &self.terminator {
                    config = config.terminator(terminator.clone());
                }
                if self.exit_command.is_some() {
                    config = config.exit_command(self.exit_command.clone());
                }
                Ok(Target::Console(config))
            }
            TransportKind::Channel => {
                let file = self
                    .connection_file
                    .as_ref()
                    .context("channel session needs a connection_file")?;
                let path = base_dir.join(file);
                let info = ConnectionInfo::load(&path)?;
                Ok(Target::Channel(info))
            }
        }
    }
}

/// Resolve a validated script into a runnable plan.
pub fn build_plan(script: &ScriptToml, base_dir: &Path) -> anyhow::Result<Plan> {
    let session = resolve_session(&script.session)?;
    let target = session.target(base_dir)?;

    let turns = script
        .turns
        .iter()
        .enumerate()
        .map(|(index, turn)| {
            let mut expectations = session
                .startup_expectations()
                .check_echo(turn.check_echo.unwrap_or(session.check_echo))
                .check_payloads(turn.check_payloads);
            expectations.expect = turn.expect.clone();
            PlannedTurn {
                label: turn
                    .label
                    .clone()
                    .unwrap_or_else(|| format!("turn {}", index + 1)),
                request: Request::new(turn.code.clone()),
                expectations,
            }
        })
        .collect();

    Ok(Plan {
        target,
        startup: session
            .startup_settle
            .then(|| session.startup_expectations()),
        turns,
    })
}
