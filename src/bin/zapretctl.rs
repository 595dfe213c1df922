//! zapretctl - CLI for controlling the zapret daemon.
//!
//! Each sub-command is one IPC round-trip. Exit code 0 on success, 1 on any
//! error, with the daemon's error string surfaced unchanged on stderr.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use zapret::config::DEFAULT_SOCKET_PATH;
use zapret::ipc::{IpcClient, Request};

#[derive(Parser)]
#[command(name = "zapretctl")]
#[command(author, version, about = "Control the zapret daemon")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon socket path
    #[arg(long, default_value = DEFAULT_SOCKET_PATH, global = true)]
    socket: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate daemon status (session, firewall, workers)
    Status,
    /// Compile the strategy, install rules, start workers
    Start,
    /// Stop workers and remove rules
    Stop,
    /// Stop (if active) then start again
    Restart,
    /// Show the daemon's configuration
    Config,
    /// Firewall backend status
    Firewall,
    /// Worker process status
    Processes,
}

impl Commands {
    fn wire_name(&self) -> &'static str {
        match self {
            Commands::Status => "status",
            Commands::Start => "start",
            Commands::Stop => "stop",
            Commands::Restart => "restart",
            Commands::Config => "config",
            Commands::Firewall => "firewall",
            Commands::Processes => "processes",
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = IpcClient::new(&cli.socket);

    let response = match client.call(&Request::new(cli.command.wire_name())).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Some(error) = response.error {
        eprintln!("error: {error}");
        std::process::exit(1);
    }

    if let Some(data) = response.data {
        render(&cli.command, &data);
    }
}

fn render(command: &Commands, data: &Value) {
    match command {
        Commands::Status => {
            print_field(data, "state", "State");
            print_field(data, "running", "Running");
            print_field(data, "uptime_secs", "Uptime (s)");
            print_field(data, "strategy", "Strategy");
            if let Some(firewall) = data.get("firewall").filter(|v| !v.is_null()) {
                print_field(firewall, "kind", "Firewall backend");
                print_field(firewall, "state", "Firewall state");
                print_field(firewall, "rule_count", "Firewall rules");
            }
            if let Some(workers) = data.get("workers") {
                print_field(workers, "count", "Workers");
                print_field(workers, "active_queues", "Active queues");
            }
        }
        _ => match serde_json::to_string_pretty(data) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{data}"),
        },
    }
}

fn print_field(data: &Value, key: &str, label: &str) {
    if let Some(value) = data.get(key) {
        match value {
            Value::String(s) => println!("{label}: {s}"),
            other => println!("{label}: {other}"),
        }
    }
}
