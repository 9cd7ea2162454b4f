//! Configuration file management for kcheck.
//!
//! Provides a TOML config file at `~/.config/kcheck/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::{Deserialize, Serialize};

use kcheck_core::collector::CollectorConfig;
use kcheck_core::session::SessionConfig;

pub const ENV_OVERALL_SECS: &str = "KCHECK_TIMEOUT_SECS";
pub const ENV_POLL_MILLIS: &str = "KCHECK_POLL_MILLIS";
pub const ENV_SETTLE_MILLIS: &str = "KCHECK_SETTLE_MILLIS";
pub const ENV_STARTUP_SECS: &str = "KCHECK_STARTUP_SECS";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutsSection {
    /// Hard bound on one turn.
    pub overall_secs: Option<u64>,
    /// Bound on one poll of a structured kernel.
    pub poll_millis: Option<u64>,
    /// Quiet window that ends a console turn.
    pub settle_millis: Option<u64>,
    /// Bound on draining console startup output.
    pub startup_secs: Option<u64>,
}

impl ConfigFile {
    /// A config file with every built-in default written out.
    pub fn with_defaults() -> Self {
        let defaults = SessionConfig::default();
        Self {
            timeouts: TimeoutsSection {
                overall_secs: Some(defaults.collector.overall_timeout.as_secs()),
                poll_millis: Some(defaults.collector.poll_interval.as_millis() as u64),
                settle_millis: Some(defaults.collector.settle.as_millis() as u64),
                startup_secs: Some(defaults.startup_timeout.as_secs()),
            },
        }
    }
}

/// Timeout overrides accepted by every command that talks to a kernel.
#[derive(Debug, Default, Clone, Args)]
pub struct TimeoutArgs {
    /// Overall timeout per turn, in seconds
    #[arg(long = "timeout")]
    pub overall_secs: Option<u64>,
    /// Poll window for structured kernels, in milliseconds
    #[arg(long = "poll-ms")]
    pub poll_millis: Option<u64>,
    /// Quiet window that ends a console turn, in milliseconds
    #[arg(long = "settle-ms")]
    pub settle_millis: Option<u64>,
    /// Timeout for console startup output, in seconds
    #[arg(long = "startup-timeout")]
    pub startup_secs: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the kcheck config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/kcheck` or `~/.config/kcheck`,
/// never the platform-specific `dirs::config_dir()`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("kcheck");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("kcheck")
}

/// Return the path to the kcheck config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file at `path`. A missing file is `Ok(None)`.
pub fn load_config(path: &Path) -> Result<Option<ConfigFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KcheckConfig {
    pub session: SessionConfig,
}

impl KcheckConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Overall timeout: `--timeout` > `KCHECK_TIMEOUT_SECS` > `timeouts.overall_secs` > 30s
    /// - Poll window: `--poll-ms` > `KCHECK_POLL_MILLIS` > `timeouts.poll_millis` > 500ms
    /// - Settle window: `--settle-ms` > `KCHECK_SETTLE_MILLIS` > `timeouts.settle_millis` > 2s
    /// - Startup timeout: `--startup-timeout` > `KCHECK_STARTUP_SECS` > `timeouts.startup_secs` > 60s
    ///
    /// A zero value from any layer is an error naming that layer.
    pub fn resolve(cli: &TimeoutArgs) -> Result<Self> {
        let file = load_config(&config_path())?;
        Self::resolve_with(cli, |key| std::env::var(key).ok(), file.as_ref())
    }

    fn resolve_with(
        cli: &TimeoutArgs,
        env: impl Fn(&str) -> Option<String>,
        file: Option<&ConfigFile>,
    ) -> Result<Self> {
        let section = file.map(|f| f.timeouts.clone()).unwrap_or_default();
        let defaults = SessionConfig::default();

        // Every window must be positive, whichever layer set it.
        let pick = |flag: Option<u64>,
                    flag_name: &str,
                    key: &str,
                    file_key: &str,
                    from_file: Option<u64>|
         -> Result<Option<u64>> {
            let (value, source) = if flag.is_some() {
                (flag, flag_name.to_string())
            } else if let Some(raw) = env(key) {
                let value = raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("{key} must be a whole number, got {raw:?}"))?;
                (Some(value), key.to_string())
            } else {
                (from_file, format!("timeouts.{file_key}"))
            };
            if value == Some(0) {
                bail!("{source} must be greater than zero");
            }
            Ok(value)
        };

        let overall = pick(cli.overall_secs, "--timeout", ENV_OVERALL_SECS, "overall_secs", section.overall_secs)?
            .map_or(defaults.collector.overall_timeout, Duration::from_secs);
        let poll = pick(cli.poll_millis, "--poll-ms", ENV_POLL_MILLIS, "poll_millis", section.poll_millis)?
            .map_or(defaults.collector.poll_interval, Duration::from_millis);
        let settle = pick(cli.settle_millis, "--settle-ms", ENV_SETTLE_MILLIS, "settle_millis", section.settle_millis)?
            .map_or(defaults.collector.settle, Duration::from_millis);
        let startup = pick(cli.startup_secs, "--startup-timeout", ENV_STARTUP_SECS, "startup_secs", section.startup_secs)?
            .map_or(defaults.startup_timeout, Duration::from_secs);

        Ok(Self {
            session: SessionConfig {
                collector: CollectorConfig {
                    overall_timeout: overall,
                    poll_interval: poll,
                    settle,
                },
                startup_timeout: startup,
            },
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = KcheckConfig::resolve_with(&TimeoutArgs::default(), env_of(&[]), None).unwrap();
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn cli_beats_env_beats_file() {
        let file = ConfigFile {
            timeouts: TimeoutsSection {
                overall_secs: Some(90),
                poll_millis: Some(250),
                settle_millis: Some(1500),
                startup_secs: Some(20),
            },
        };
        let cli = TimeoutArgs {
            overall_secs: Some(5),
            ..TimeoutArgs::default()
        };
        let env = env_of(&[(ENV_OVERALL_SECS, "7"), (ENV_POLL_MILLIS, "100")]);

        let config = KcheckConfig::resolve_with(&cli, env, Some(&file)).unwrap();
        let collector = config.session.collector;
        assert_eq!(collector.overall_timeout, Duration::from_secs(5));
        assert_eq!(collector.poll_interval, Duration::from_millis(100));
        assert_eq!(collector.settle, Duration::from_millis(1500));
        assert_eq!(config.session.startup_timeout, Duration::from_secs(20));
    }

    #[test]
    fn malformed_env_value_is_an_error() {
        let err = KcheckConfig::resolve_with(
            &TimeoutArgs::default(),
            env_of(&[(ENV_SETTLE_MILLIS, "soon")]),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains(ENV_SETTLE_MILLIS), "{err}");
    }

    #[test]
    fn zero_durations_are_rejected_and_named() {
        let cli = TimeoutArgs {
            settle_millis: Some(0),
            ..TimeoutArgs::default()
        };
        let err = KcheckConfig::resolve_with(&cli, env_of(&[]), None).unwrap_err();
        assert_eq!(err.to_string(), "--settle-ms must be greater than zero");

        let err = KcheckConfig::resolve_with(
            &TimeoutArgs::default(),
            env_of(&[(ENV_POLL_MILLIS, "0")]),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains(ENV_POLL_MILLIS), "{err}");

        let file = ConfigFile {
            timeouts: TimeoutsSection {
                overall_secs: Some(0),
                ..TimeoutsSection::default()
            },
        };
        let err = KcheckConfig::resolve_with(&TimeoutArgs::default(), env_of(&[]), Some(&file))
            .unwrap_err();
        assert!(err.to_string().contains("timeouts.overall_secs"), "{err}");

        let cli = TimeoutArgs {
            startup_secs: Some(0),
            ..TimeoutArgs::default()
        };
        assert!(KcheckConfig::resolve_with(&cli, env_of(&[]), None).is_err());
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("kcheck").join("config.toml");

        save_config(&ConfigFile::with_defaults(), &path).unwrap();
        let loaded = load_config(&path).unwrap().expect("file was written");
        assert_eq!(loaded.timeouts, ConfigFile::with_defaults().timeouts);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[timeouts]"), "{contents}");
        assert!(contents.contains("overall_secs = 30"), "{contents}");
    }

    #[test]
    fn missing_file_is_none_and_partial_file_is_accepted() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(load_config(&tmp.path().join("absent.toml")).unwrap().is_none());

        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[timeouts]\nsettle_millis = 800\n").unwrap();
        let loaded = load_config(&path).unwrap().unwrap();
        assert_eq!(loaded.timeouts.settle_millis, Some(800));
        assert_eq!(loaded.timeouts.overall_secs, None);
    }

    #[test]
    fn malformed_file_reports_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[timeouts\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }
}
