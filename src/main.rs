use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use chrono::Local;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use gantry::config::{Config, CONFIG_FILE};
use gantry::core::TaskKind;
use gantry::orchestration::{ExecutionReport, Orchestrator, RunEvent};
use gantry::pipeline::{Pipeline, Step, Toolchain, ENTRY_POINTS};
use gantry::{glog, glog_error, Error, Result};

/// Gantry - static-site build orchestrator
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    GANTRY_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.gantry/gantry.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file
    #[arg(short = 'c', long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Minify scripts, styles and pages
    #[arg(long, visible_alias = "prod", global = true)]
    pub production: bool,

    /// Port for dist-serve
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Open a browser when dist-serve starts
    #[arg(long, global = true)]
    pub open: bool,

    /// Branch to publish to
    #[arg(long, global = true)]
    pub branch: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run an entry point or a single step
    Run {
        /// Task name, e.g. build
        task: String,

        /// Print the execution report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List entry points and steps
    List,

    /// Write a default gantry.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    gantry::log::init(cli.debug);
    glog!("gantry {:?}", cli.command);

    let result = match cli.command.clone() {
        Command::Run { task, json } => run_task(&cli, &task, json),
        Command::List => list(&cli).map(|()| ExitCode::SUCCESS),
        Command::Init { force } => init(&cli.config, force).map(|()| ExitCode::SUCCESS),
    };

    result.unwrap_or_else(|e| {
        glog_error!("{}", e);
        eprintln!("gantry: {}", e);
        ExitCode::from(2)
    })
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_from(&cli.config)?;
    if cli.production {
        config.production = true;
    }
    if let Some(port) = cli.port {
        config.serve.port = port;
    }
    if cli.open {
        config.serve.open = true;
    }
    if let Some(branch) = &cli.branch {
        config.deploy.branch = branch.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run_task(cli: &Cli, name: &str, json: bool) -> Result<ExitCode> {
    let config = load_config(cli)?;
    let pipeline = Pipeline::from_config(&config)?;
    let task = pipeline.resolve(name)?;

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let (tx, rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_events(rx, !json));
        let report = Orchestrator::new(config.run_options())
            .with_events(tx)
            .run(&task)
            .await;
        // The orchestrator owned the only sender, so the printer drains and stops.
        let _ = printer.await;
        report
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<RunEvent>, enabled: bool) {
    while let Some(event) = rx.recv().await {
        if !enabled {
            continue;
        }
        match event {
            RunEvent::TaskStarted { task, kind, .. } if is_named(&task, kind) => {
                println!("[{}] Starting '{}'...", now(), task);
            }
            RunEvent::TaskSucceeded {
                task, kind, elapsed, ..
            } if is_named(&task, kind) => {
                println!(
                    "[{}] Finished '{}' after {}",
                    now(),
                    task,
                    format_elapsed(elapsed)
                );
            }
            RunEvent::TaskFailed {
                task,
                kind,
                error,
                elapsed,
                ..
            } if kind == TaskKind::Atomic => {
                eprintln!(
                    "[{}] '{}' errored after {}: {}",
                    now(),
                    task,
                    format_elapsed(elapsed),
                    error
                );
            }
            _ => {}
        }
    }
}

// Anonymous composites are labelled with their kind.
fn is_named(task: &str, kind: TaskKind) -> bool {
    kind == TaskKind::Atomic || task != kind.to_string()
}

fn now() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 1.0 {
        format!("{} ms", elapsed.as_millis())
    } else if secs < 60.0 {
        format!("{:.2} s", secs)
    } else {
        format!("{:.1} min", secs / 60.0)
    }
}

fn print_summary(report: &ExecutionReport) {
    if let Some(failure) = &report.failure {
        eprintln!();
        eprintln!("'{}' failed", report.task);
        for (depth, task) in failure.chain().iter().enumerate() {
            eprintln!("{}{}", "  ".repeat(depth + 1), task);
        }
        eprintln!("  error: {}", failure.error());
    }
    for violation in &report.violations {
        eprintln!("warning: {}", violation);
    }
}

fn list(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let pipeline = Pipeline::from_config(&config)?;
    let toolchain = Toolchain::from_config(&config);

    println!("Entry points:");
    for name in ENTRY_POINTS {
        for line in pipeline.describe(name)?.lines() {
            println!("  {}", line);
        }
    }

    println!();
    println!("Steps:");
    for step in Step::ALL {
        let how = match (toolchain.command(step), step) {
            (Some(command), _) => command.template().to_string(),
            (None, Step::Clean | Step::Extra) => "(built-in)".to_string(),
            (None, _) => "(not configured)".to_string(),
        };
        println!("  {:<12} {}", step.name(), how);
    }
    Ok(())
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Validation(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
