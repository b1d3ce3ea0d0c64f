//! CLI for the podder unprivileged container runtime.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use podder::{Error, LayerStore};

#[derive(Parser)]
#[command(name = "podder", version, about = "Unprivileged layer-based container runtime")]
struct Cli {
    /// Overrides the layer store root (defaults to `$PODDER_STORE`, else
    /// the platform data directory).
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull an OCI image into the store under `name`.
    Pull {
        /// Image reference (e.g. `ubuntu:22.04`, `ghcr.io/org/app:v1`).
        reference: String,
        /// Name to give the resulting layer.
        name: String,
    },
    /// Create a new, empty layer.
    Create {
        /// Name for the new layer.
        name: String,
        /// Parent layer to stack on, if any.
        #[arg(long)]
        parent: Option<String>,
    },
    /// Start a layer's container.
    Start {
        /// Layer name.
        name: String,
    },
    /// Stop a layer's running container.
    Stop {
        /// Layer name.
        name: String,
        /// Signal to send first, by name (`SIGTERM`) or number (`15`).
        #[arg(long, default_value = "SIGTERM")]
        signal: String,
        /// Seconds to wait for exit before escalating to `SIGKILL`.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Show a layer's status.
    Status {
        /// Layer name.
        name: String,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// Remove a layer.
    Rm {
        /// Layer name.
        name: String,
    },
    /// List every layer in the store.
    List {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// Generate shell completion scripts.
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for list/status commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("PODDER_LOG"))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().dispatch().await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("podder: {e:#}");
            std::process::exit(exit_code(&e));
        }
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        let store = open_store(self.store.as_deref())?;
        match self.command {
            Command::Pull { reference, name } => pull(&store, &reference, &name).await,
            Command::Create { name, parent } => create(&store, &name, parent.as_deref()),
            Command::Start { name } => start(&store, &name),
            Command::Stop { name, signal, timeout } => stop(&store, &name, &signal, timeout),
            Command::Status { name, format } => status(&store, &name, format),
            Command::Rm { name } => rm(&store, &name),
            Command::List { format } => list(&store, format),
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "podder",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

fn open_store(path: Option<&str>) -> Result<LayerStore> {
    let store = match path {
        Some(p) => LayerStore::open(p),
        None => LayerStore::open_default(),
    };
    store.context("failed to open layer store")
}

async fn pull(store: &LayerStore, reference: &str, name: &str) -> Result<()> {
    let client = podder_oci::Client::new();
    let layer = podder::pull(store, &client, reference, name)
        .await
        .context("pull failed")?;
    println!("{}", layer.name());
    Ok(())
}

fn create(store: &LayerStore, name: &str, parent: Option<&str>) -> Result<()> {
    let layer = podder::create(store, name, parent).context("create failed")?;
    println!("{}", layer.name());
    Ok(())
}

fn start(store: &LayerStore, name: &str) -> Result<()> {
    let outcome = podder::start(store, name).context("start failed")?;
    println!("{}", outcome.host_pid);
    Ok(())
}

fn stop(store: &LayerStore, name: &str, signal: &str, timeout_secs: u64) -> Result<()> {
    let signal = parse_signal(signal)?;
    let timeout = std::time::Duration::from_secs(timeout_secs);
    podder::stop(store, name, signal, timeout).context("stop failed")?;
    Ok(())
}

/// Parses a `--signal` argument as either a nix signal name (`SIGTERM`,
/// `TERM`) or a raw signal number (`15`).
fn parse_signal(s: &str) -> Result<nix::sys::signal::Signal> {
    use std::str::FromStr;

    if let Ok(n) = s.parse::<i32>() {
        return nix::sys::signal::Signal::try_from(n)
            .with_context(|| format!("unknown signal number: {n}"));
    }
    let name = if s.starts_with("SIG") {
        s.to_owned()
    } else {
        format!("SIG{}", s.to_uppercase())
    };
    nix::sys::signal::Signal::from_str(&name).with_context(|| format!("unknown signal: {s}"))
}

fn status(store: &LayerStore, name: &str, format: OutputFormat) -> Result<()> {
    let status = podder::status(store, name).context("status failed")?;

    if matches!(format, OutputFormat::Json) {
        let obj = serde_json::json!({
            "name": status.name,
            "parent": status.parent,
            "running_pid": status.running_pid,
        });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }

    println!("name:    {}", status.name);
    println!("parent:  {}", status.parent.as_deref().unwrap_or("-"));
    match status.running_pid {
        Some(pid) => println!("status:  running (pid {pid})"),
        None => println!("status:  stopped"),
    }
    Ok(())
}

fn rm(store: &LayerStore, name: &str) -> Result<()> {
    podder::rm(store, name).context("rm failed")?;
    eprintln!("Removed: {name}");
    Ok(())
}

fn list(store: &LayerStore, format: OutputFormat) -> Result<()> {
    let layers = podder::list(store).context("list failed")?;

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&layers)?);
        return Ok(());
    }

    if layers.is_empty() {
        println!("No layers.");
        return Ok(());
    }
    println!("{:<30} {:<30} {:>10}", "NAME", "PARENT", "STATUS");
    for l in &layers {
        let status = match l.running_pid {
            Some(pid) => format!("running ({pid})"),
            None => "stopped".to_owned(),
        };
        println!(
            "{:<30} {:<30} {:>10}",
            l.name,
            l.parent.as_deref().unwrap_or("-"),
            status
        );
    }
    Ok(())
}

/// Maps a library error onto the exit codes spec §6 names literally: `2`
/// not found, `3` already running, `4` auth failure, `5` digest mismatch,
/// `6` no matching platform, `1` anything else (including conflicts spec §6
/// doesn't assign their own code to, such as `Exists`/`HasChildren`).
fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<Error>() {
        Some(Error::NotFound(_) | Error::BrokenParent(..)) => 2,
        Some(Error::AlreadyRunning(_)) => 3,
        Some(Error::Oci(podder_oci::Error::AuthRequired(_) | podder_oci::Error::AuthFailed(_))) => {
            4
        }
        Some(Error::Oci(podder_oci::Error::DigestMismatch(_))) => 5,
        Some(Error::Oci(podder_oci::Error::NoMatchingPlatform(_))) => 6,
        _ => 1,
    }
}
