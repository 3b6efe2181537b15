//! # Worker — CLI Entry Point
//!
//! `worker <server_host> <server_port> [threads] [-v|--verbose]`
//!
//! Validates arguments, configures logging, and hands control to the node
//! state machine. Exit codes: 0 for normal termination (including a STOP
//! broadcast), 1 for usage, handshake, or session errors.
//!
//! Verbose mode prints FSM transitions, per-worker counters on each
//! checkpoint, and the outgoing/incoming message log; the default level
//! prints only errors and the final result line.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shadowreach::node::{self, NodeConfig};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "worker",
    about = "Distributed crypt(3) password search worker",
    version
)]
struct Cli {
    /// Coordinator host name or address
    server_host: String,

    /// Coordinator registration port (1-65535)
    server_port: u16,

    /// Worker pool size (defaults to all logical cores)
    threads: Option<usize>,

    /// Print state transitions, per-worker counters, and the message log
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    // clap's default exit code for usage errors is 2; this tool's contract
    // is 1, with help/version still exiting 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.server_port == 0 {
        eprintln!("error: server_port must be in 1..=65535");
        std::process::exit(1);
    }
    let threads = cli.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    if threads == 0 {
        eprintln!("error: threads must be a positive integer");
        std::process::exit(1);
    }

    let config = NodeConfig::new(cli.server_host, cli.server_port, threads);
    info!(
        node_id = %config.node_id,
        server = %format!("{}:{}", config.server_host, config.server_port),
        threads,
        crypt_library = shadowreach::crypt::library_name().unwrap_or("unresolved"),
        "worker starting"
    );

    std::process::exit(node::run(&config));
}
