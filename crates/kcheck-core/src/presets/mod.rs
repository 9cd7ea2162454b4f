//! Kernel preset library.
//!
//! Presets bundle the launch command and leakage expectations of kernels
//! that are checked often. They are defined in `kernels.toml` and embedded
//! in the binary at compile time.

use serde::Deserialize;

use crate::script::TransportKind;

/// A single kernel preset from the embedded library.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KernelPreset {
    /// Unique preset name (e.g. `xeus-sas-console`).
    pub name: String,
    pub description: String,
    pub transport: TransportKind,
    /// Console command line, split on whitespace.
    pub command: String,
    /// Internal completion marker the kernel must strip.
    #[serde(default)]
    pub marker: Option<String>,
    /// Phrase printed once when the kernel initializes.
    #[serde(default)]
    pub init_phrase: Option<String>,
    #[serde(default)]
    pub exit_command: Option<String>,
    /// Whether numbered input echo is checked by default.
    #[serde(default)]
    pub check_echo: bool,
}

/// Container for deserializing the embedded TOML file.
#[derive(Debug, Deserialize)]
struct PresetLibrary {
    presets: Vec<KernelPreset>,
}

/// The embedded kernel presets TOML.
static PRESETS_TOML: &str = include_str!("kernels.toml");

/// Load all kernel presets from the embedded library.
///
/// # Panics
///
/// Panics if the embedded TOML is malformed. The file is compiled into the
/// binary, so a successful build with passing tests means it parses.
pub fn load_presets() -> Vec<KernelPreset> {
    let lib: PresetLibrary =
        toml::from_str(PRESETS_TOML).expect("embedded kernels.toml is invalid");
    lib.presets
}

/// Look up a preset by exact name.
pub fn find_preset(name: &str) -> Option<KernelPreset> {
    load_presets().into_iter().find(|p| p.name == name)
}

/// Names of every preset, in library order.
pub fn preset_names() -> Vec<String> {
    load_presets().into_iter().map(|p| p.name).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConsoleConfig;

    #[test]
    fn load_presets_returns_nonempty() {
        assert!(!load_presets().is_empty(), "embedded preset library should not be empty");
    }

    #[test]
    fn preset_names_are_unique() {
        let mut names = preset_names();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total, "duplicate preset names");
    }

    #[test]
    fn xeus_sas_preset_carries_expectations() {
        let preset = find_preset("xeus-sas-console").expect("preset should exist");
        assert_eq!(preset.transport, TransportKind::Console);
        assert_eq!(preset.marker.as_deref(), Some("XEUS_SAS_END"));
        assert_eq!(preset.init_phrase.as_deref(), Some("SAS initialization"));
        assert!(preset.check_echo);

        assert_eq!(preset.exit_command.as_deref(), Some("exit"));
        let console = ConsoleConfig::from_command_line(&preset.command).expect("command should parse");
        assert_eq!(console.program, "jupyter");
        assert_eq!(console.args, vec!["console", "--kernel=xeus-sas"]);
    }

    #[test]
    fn every_console_preset_has_a_command() {
        for preset in load_presets() {
            if preset.transport == TransportKind::Console {
                assert!(
                    ConsoleConfig::from_command_line(&preset.command).is_some(),
                    "preset {} has an empty command",
                    preset.name
                );
            }
        }
    }

    #[test]
    fn unknown_preset_is_none() {
        assert!(find_preset("no-such-kernel").is_none());
    }
}
