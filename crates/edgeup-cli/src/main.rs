mod commands;
mod render;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use edgeup_core::{UpdaterConfig, DEFAULT_CONFIG_PATH};
use tracing_subscriber::EnvFilter;

use crate::commands::{check_update, run_doctor, run_update, show_status, CommandReport};
use crate::render::{output_style, print_lines, render_status_line, OutputStyle};

/// Exit code for failures before a run starts, such as an unreadable config.
const SETUP_FAILURE_EXIT_CODE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "edgeup")]
#[command(about = "Health-gated self-updater for edge services", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(long, global = true, env = "EDGEUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Log at debug level regardless of EDGEUP_LOG.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Disable colors and the progress spinner.
    #[arg(long, global = true)]
    plain: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the latest release if it differs, behind the health gate.
    Run,
    /// Compare the installed release with the latest one.
    Check,
    /// Show the installed release, stale backups, and the last run.
    Status,
    /// Print resolved paths and configuration checks.
    Doctor,
    Completions {
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let style = output_style(cli.plain);

    match run_cli(cli, style) {
        Ok(exit_code) => ExitCode::from(exit_code),
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(style, "err", &format!("error: {err:#}"))
            );
            ExitCode::from(SETUP_FAILURE_EXIT_CODE)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("EDGEUP_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_cli(cli: Cli, style: OutputStyle) -> Result<u8> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        write_completions_script(shell, &mut stdout)?;
        return Ok(0);
    }

    let config = UpdaterConfig::load(&cli.config)?;
    let report = match cli.command {
        Commands::Run => run_update(&config, style)?,
        Commands::Check => check_update(&config, style)?,
        Commands::Status => show_status(&config, style)?,
        Commands::Doctor => run_doctor(&cli.config, &config, style)?,
        Commands::Completions { .. } => CommandReport {
            lines: Vec::new(),
            exit_code: 0,
        },
    };
    print_lines(&report.lines);
    Ok(report.exit_code)
}

fn write_completions_script<W: Write>(shell: Shell, writer: &mut W) -> Result<()> {
    let mut command = Cli::command();
    let mut generated = Vec::new();
    clap_complete::generate(shell, &mut command, "edgeup", &mut generated);
    writer
        .write_all(&generated)
        .with_context(|| "failed writing generated completion script")?;
    Ok(())
}
