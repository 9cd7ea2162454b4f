//! TOML format of a check script.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which transport a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Channel,
    Console,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Channel => f.write_str("channel"),
            TransportKind::Console => f.write_str("console"),
        }
    }
}

/// Top-level structure of a check script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptToml {
    pub session: SessionToml,
    #[serde(default)]
    pub turns: Vec<TurnToml>,
}

/// The `[session]` table: how to reach the kernel and session-wide checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionToml {
    /// Name of an embedded preset supplying defaults for the fields below.
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub transport: Option<TransportKind>,
    /// Console command line, split on whitespace.
    #[serde(default)]
    pub command: Option<String>,
    /// Channel connection file, relative to the script's directory.
    #[serde(default)]
    pub connection_file: Option<PathBuf>,
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub init_phrase: Option<String>,
    /// Text written after each request on a console transport.
    #[serde(default)]
    pub terminator: Option<String>,
    #[serde(default)]
    pub exit_command: Option<String>,
    /// Drain console startup output before the first turn.
    #[serde(default = "default_true")]
    pub startup_settle: bool,
    /// Default for turns that do not set `check_echo`.
    #[serde(default)]
    pub check_echo: Option<bool>,
}

/// One `[[turns]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnToml {
    #[serde(default)]
    pub label: Option<String>,
    pub code: String,
    /// Literal substring the turn's output must contain.
    #[serde(default)]
    pub expect: Option<String>,
    #[serde(default)]
    pub check_echo: Option<bool>,
    #[serde(default = "default_true")]
    pub check_payloads: bool,
}

fn default_true() -> bool {
    true
}
