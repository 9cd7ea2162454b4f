mod config;
mod run_cmd;

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};

use kcheck_core::presets;

use config::{ConfigFile, TimeoutArgs};

#[derive(Parser)]
#[command(
    name = "kcheck",
    about = "Turn-level verification harness for interactive compute kernels"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Report rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every turn of a check script in one session
    Run {
        /// Path to the check script (TOML)
        script: PathBuf,
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
        #[command(flatten)]
        timeouts: TimeoutArgs,
    },
    /// Run a single ad hoc turn
    #[command(group(
        ArgGroup::new("target")
            .required(true)
            .args(["console", "connection", "preset"])
    ))]
    Exec {
        /// Code to submit
        #[arg(long)]
        code: String,
        /// Literal substring the output must contain
        #[arg(long)]
        expect: Option<String>,
        /// Console command line to spawn
        #[arg(long)]
        console: Option<String>,
        /// Kernel connection file (JSON)
        #[arg(long)]
        connection: Option<PathBuf>,
        /// Embedded kernel preset name (see `kcheck presets`)
        #[arg(long)]
        preset: Option<String>,
        /// Completion marker that must not reach visible output
        #[arg(long)]
        marker: Option<String>,
        /// Phrase the kernel prints once at initialization
        #[arg(long)]
        init_phrase: Option<String>,
        /// Fail if console output echoes the input behind a line number
        #[arg(long)]
        check_echo: bool,
        /// Skip draining console startup output before the turn
        #[arg(long)]
        no_startup_settle: bool,
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
        #[command(flatten)]
        timeouts: TimeoutArgs,
    },
    /// List the embedded kernel presets
    Presets,
    /// Write a kcheck config file with the default timeouts
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reports go to stdout; logs stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            format,
            timeouts,
        } => {
            let code = run_cmd::run_script(&script, format, &timeouts).await?;
            std::process::exit(code);
        }
        Commands::Exec {
            code,
            expect,
            console,
            connection,
            preset,
            marker,
            init_phrase,
            check_echo,
            no_startup_settle,
            format,
            timeouts,
        } => {
            let args = run_cmd::ExecArgs {
                code,
                expect,
                console,
                connection,
                preset,
                marker,
                init_phrase,
                check_echo,
                startup_settle: !no_startup_settle,
            };
            let code = run_cmd::run_exec(args, format, &timeouts).await?;
            std::process::exit(code);
        }
        Commands::Presets => {
            cmd_presets();
        }
        Commands::Init { force } => {
            cmd_init(force)?;
        }
    }

    Ok(())
}

fn cmd_presets() {
    for preset in presets::load_presets() {
        println!("{:<20} {:<8} {}", preset.name, preset.transport, preset.description);
        println!("{:<20} {:<8} $ {}", "", "", preset.command);
    }
}

fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {}; use --force to overwrite",
            path.display()
        );
    }
    config::save_config(&ConfigFile::with_defaults(), &path)
        .with_context(|| format!("failed to initialize {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
