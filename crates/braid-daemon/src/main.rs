#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::Context;
use braid_daemon::client::{Client, ClientOptions};
use braid_daemon::server::{self, ServeOptions};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "braidd: daemon for braid issue workspaces",
    long_about = None
)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON output and JSON logs instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Suppress everything below errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground.
    Serve {
        /// Unix socket path to listen on.
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Loopback TCP port used where domain sockets are unavailable.
        #[arg(long)]
        port: Option<u16>,

        /// Actor recorded on writes routed through this daemon.
        #[arg(long)]
        actor: Option<String>,
    },

    /// Query a running daemon.
    Status {
        /// Unix socket path the daemon listens on.
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Loopback TCP port to try when the socket is unreachable.
        #[arg(long)]
        port: Option<u16>,

        /// Include this workspace's counts in the report.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Ask a running daemon to shut down.
    Stop {
        /// Unix socket path the daemon listens on.
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Loopback TCP port to try when the socket is unreachable.
        #[arg(long)]
        port: Option<u16>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        Commands::Serve {
            socket,
            port,
            actor,
        } => server::serve(ServeOptions {
            socket,
            port,
            actor,
        }),
        Commands::Status {
            socket,
            port,
            workspace,
        } => {
            let client = Client::new(ClientOptions {
                socket,
                port,
                ..ClientOptions::default()
            });
            let params = workspace.map_or(Value::Null, |root| json!({ "workspace": root }));
            let status = client
                .call_daemon("daemon.status", params)
                .context("query daemon status")?;
            render_status(&status, cli.json);
            Ok(())
        }
        Commands::Stop { socket, port } => {
            let client = Client::new(ClientOptions {
                socket,
                port,
                ..ClientOptions::default()
            });
            client
                .call_daemon("daemon.stop", Value::Null)
                .context("reach the daemon")?;
            if cli.json {
                println!("{}", json!({ "stopping": true }));
            } else {
                println!("daemon asked to stop");
            }
            Ok(())
        }
    }
}

fn render_status(status: &Value, as_json: bool) {
    if as_json {
        println!("{status:#}");
        return;
    }
    let version = status["version"].as_str().unwrap_or("unknown");
    let uptime = status["uptime_secs"].as_u64().unwrap_or(0);
    println!("braid daemon v{version}, up {uptime}s");
    if let Some(workspaces) = status["workspaces"].as_array() {
        if workspaces.is_empty() {
            println!("no workspaces activated");
        }
        for entry in workspaces {
            println!(
                "  {} [{}]",
                entry["root"].as_str().unwrap_or("?"),
                entry["state"].as_str().unwrap_or("?")
            );
        }
    }
    if let Some(workspace) = status.get("workspace") {
        if workspace["quarantined"].as_bool() == Some(true) {
            println!(
                "workspace quarantined: {}",
                workspace["reason"].as_str().unwrap_or("unknown")
            );
        } else if let Some(issues) = workspace["issues"].as_object() {
            let counts: Vec<String> = issues
                .iter()
                .map(|(status, count)| format!("{count} {status}"))
                .collect();
            println!("workspace: {}", counts.join(", "));
            println!(
                "ready {}, blocked {}, conflicts {}",
                workspace["ready"], workspace["blocked"], workspace["conflicts"]
            );
        }
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "braid_core=info,braid_daemon=info,warn",
            1 => "braid_core=debug,braid_daemon=debug,info",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}
