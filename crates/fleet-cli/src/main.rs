use std::io::Write;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fleet_session::fly::FlyControlPlane;
use fleet_session::{MemoryCredentialStore, SessionConfig, Supervisor, SupervisorHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Manage agent machines on Fly.io and attach to their terminals")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ensure the app exists and print every machine as JSON
    List,

    /// Launch a new agent machine
    Launch {
        /// Machine name (defaults to a generated agent-xxxxxxxx)
        #[arg(long)]
        name: Option<String>,
    },

    /// Start the machine if needed, connect, and pipe stdin/stdout through it
    Attach {
        machine_id: String,

        /// Terminal size sent once connected
        #[arg(long, requires = "cols")]
        rows: Option<u16>,

        #[arg(long, requires = "rows")]
        cols: Option<u16>,
    },

    /// Stop a machine
    Suspend { machine_id: String },

    /// Delete a machine
    Delete { machine_id: String },

    /// Re-read a machine's state from the control plane
    Refresh { machine_id: String },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = SessionConfig::from_env().expect("invalid configuration");
    let credentials = MemoryCredentialStore::from_env();
    let control = FlyControlPlane::from_credentials(&credentials).expect("FLY_API_TOKEN must be set");
    let handle = Supervisor::spawn(config, Arc::new(control), Arc::new(credentials));

    let result = run(&handle, cli.command).await;
    handle.shutdown().await;

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

async fn run(handle: &SupervisorHandle, command: Commands) -> fleet_session::Result<()> {
    handle.discover().await?;

    match command {
        Commands::List => print_snapshot(handle),
        Commands::Launch { name } => {
            let machine = handle.launch(name).await?;
            println!("{}", machine.id);
        }
        Commands::Attach {
            machine_id,
            rows,
            cols,
        } => attach(handle, &machine_id, rows.zip(cols)).await?,
        Commands::Suspend { machine_id } => {
            handle.suspend(&machine_id).await?;
            print_snapshot(handle);
        }
        Commands::Delete { machine_id } => handle.delete(&machine_id).await?,
        Commands::Refresh { machine_id } => {
            handle.refresh(&machine_id).await?;
            print_snapshot(handle);
        }
    }
    Ok(())
}

fn print_snapshot(handle: &SupervisorHandle) {
    match serde_json::to_string_pretty(&handle.snapshot()) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "failed to encode snapshot"),
    }
}

async fn attach(
    handle: &SupervisorHandle,
    machine_id: &str,
    size: Option<(u16, u16)>,
) -> fleet_session::Result<()> {
    let mut output = handle.subscribe_output();
    let mut snapshots = handle.subscribe();

    handle.activate(machine_id).await?;

    // A stopped machine only connects once the boot has been observed.
    let connected = snapshots
        .wait_for(|s| {
            s.record(machine_id)
                .is_none_or(|r| r.connected() || (r.pending.is_none() && r.last_error.is_some()))
        })
        .await
        .map(|s| s.record(machine_id).is_some_and(|r| r.connected()))
        .unwrap_or(false);
    if !connected {
        return Err(fleet_session::Error::NotConnected);
    }

    if let Some((rows, cols)) = size {
        handle.resize(rows, cols).await?;
    }

    let printer = tokio::spawn(async move {
        loop {
            match output.recv().await {
                Ok(chunk) => {
                    print!("{}", chunk.text);
                    let _ = std::io::stdout().flush();
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "terminal output lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        handle.send(format!("{line}\n")).await?;
    }

    printer.abort();
    Ok(())
}
