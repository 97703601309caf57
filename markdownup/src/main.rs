// markdownup command-line entry point
// start/stop/status/list manage background instances; serve runs one in the foreground.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use markdownup_lib::instance::launcher::CHILD_FLAG;
use markdownup_lib::instance::{platform, Config, Launcher, Outcome, Registry, Terminator};
use markdownup_lib::server::{self, ServeOptions};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "markdownup",
    version,
    about = "Serve a directory of Markdown files with live reload",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a background server for a directory
    Start {
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,

        /// Preferred port; fallbacks are tried when it is taken
        #[arg(short, long)]
        port: Option<u16>,

        /// Show the page header with credits and logo
        #[arg(long)]
        header: bool,

        #[arg(long = "child", hide = true)]
        child: bool,
    },

    /// Stop every running instance
    Stop {
        /// Print the stop report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the latest (or a specific) instance
    Status {
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// List recorded instances
    List {
        #[arg(long)]
        json: bool,
    },

    /// Run a server in the foreground
    Serve {
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,

        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        header: bool,

        /// Set by `start` on the detached process
        #[arg(long = "child", hide = true)]
        child: bool,
    },
}

#[derive(Debug, Serialize)]
struct ListedInstance {
    port: u16,
    pid: u32,
    running: bool,
    url: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    let config = Config::from_env();

    match cli.command {
        Command::Start {
            directory,
            port,
            header,
            child,
        } => {
            if child || std::env::args().any(|a| a == CHILD_FLAG) {
                eprintln!("markdownup: refusing to start an instance from a detached instance");
                std::process::exit(1);
            }
            run_start(config, directory, port, header)
        }
        Command::Stop { json } => run_stop(config, json),
        Command::Status { port } => run_status(config, port),
        Command::List { json } => run_list(config, json),
        Command::Serve {
            directory,
            port,
            header,
            child,
        } => {
            let options = ServeOptions {
                root: directory,
                port: port.unwrap_or(config.default_port),
                header,
                child,
            };
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(server::serve(config, options))
        }
    }
}

/// Log to stderr; `RUST_LOG` overrides. Background children log at info into
/// their log file, interactive commands only surface warnings.
fn init_tracing(command: &Command) {
    let (default_level, ansi) = match command {
        Command::Serve { child: true, .. } => ("info", false),
        Command::Serve { .. } => ("info", true),
        _ => ("warn", true),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .init();
}

fn run_start(config: Config, directory: PathBuf, port: Option<u16>, header: bool) -> Result<()> {
    let port = port.unwrap_or(config.default_port);
    let extra_flags: Vec<String> = if header {
        vec!["--header".to_string()]
    } else {
        Vec::new()
    };

    let launcher = Launcher::new(config, platform());
    let result = match launcher.start(&directory, port, &extra_flags) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("markdownup: {e}");
            std::process::exit(1);
        }
    };

    let url_port = result.reported_port();
    println!("Started markdownup in the background (PID: {})", result.pid);
    println!("  URL: http://localhost:{url_port}/");
    println!("  Log: {}", result.log_path.display());
    if result.detected_port.is_none() {
        println!("  (port not confirmed yet; check the log if the page does not load)");
    } else if url_port != port {
        println!("  (port {port} was unavailable)");
    }
    Ok(())
}

fn run_stop(config: Config, json: bool) -> Result<()> {
    let registry = Registry::new(&config);
    let terminator = Terminator::new(registry, platform(), config.well_known_ports());
    let report = terminator.stop_all();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for failed in &report.failed {
        eprintln!(
            "markdownup: could not stop instance on port {} (PID: {})",
            failed.port, failed.pid
        );
    }
    if report.is_empty() {
        println!("No running markdownup instances");
    } else {
        for stopped in &report.stopped {
            println!("Stopped port {} (PID: {})", stopped.port, stopped.pid);
        }
        println!("Stopped {} instance(s)", report.count());
    }
    Ok(())
}

fn run_status(config: Config, port: Option<u16>) -> Result<()> {
    let registry = Registry::new(&config);
    let control = platform();

    match registry.lookup(port) {
        Outcome::Done(instance) => {
            let state = if control.is_running(instance.pid) {
                "running"
            } else {
                "not running (stale record)"
            };
            println!("markdownup on port {}: {state}", instance.port);
            println!("  PID: {}", instance.pid);
            println!("  URL: http://localhost:{}/", instance.port);
            Ok(())
        }
        Outcome::NotFound => {
            match port {
                Some(port) => eprintln!("No markdownup instance recorded for port {port}"),
                None => eprintln!("No running markdownup instance"),
            }
            std::process::exit(1);
        }
        Outcome::Fatal(e) => Err(e.into()),
    }
}

fn run_list(config: Config, json: bool) -> Result<()> {
    let registry = Registry::new(&config);
    let control = platform();

    let instances: Vec<ListedInstance> = registry
        .list_all()
        .into_iter()
        .map(|instance| ListedInstance {
            port: instance.port,
            pid: instance.pid,
            running: control.is_running(instance.pid),
            url: format!("http://localhost:{}/", instance.port),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!("No markdownup instances recorded");
        return Ok(());
    }
    for instance in &instances {
        let state = if instance.running { "running" } else { "stale" };
        println!(
            "port {:<5}  PID {:<8}  {:<7}  {}",
            instance.port, instance.pid, state, instance.url
        );
    }
    Ok(())
}
