//! ptyhub: terminal client for a ptyhub server.
//!
//! Lists the server's shared shell sessions and attaches the local terminal
//! to one of them over the CBOR event protocol.

mod client;
mod commands;
mod terminal;

use clap::{Parser, Subcommand};
use tracing::error;

/// ptyhub: shared PTY sessions client
#[derive(Parser)]
#[command(name = "ptyhub", version, about = "Attach to shared PTY sessions on a ptyhub server")]
struct Cli {
    /// Gateway URL of the server
    #[arg(
        short,
        long,
        global = true,
        env = "PTYHUB_SERVER",
        default_value = "ws://127.0.0.1:4000/ws"
    )]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List live sessions
    Sessions,

    /// Attach the terminal to a session (Ctrl+] detaches)
    Attach {
        /// Session id, id prefix, display name or number
        session: String,
    },

    /// Create a session and attach to it
    New,

    /// Terminate a session's shell
    Close {
        /// Session id, id prefix, display name or number
        session: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("ptyhub=debug,ptyhub_cli=debug,ptyhub_core=debug")
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("ptyhub=warn,ptyhub_cli=warn")
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match cli.command {
        Command::Sessions => commands::sessions::run(&cli.server).await,
        Command::Attach { session } => commands::attach::run(&cli.server, &session).await,
        Command::New => commands::new::run(&cli.server).await,
        Command::Close { session } => commands::close::run(&cli.server, &session).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("ptyhub: {e:#}");
        std::process::exit(1);
    }
}
