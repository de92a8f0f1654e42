//! TileCatcher CLI - command-line interface.
//!
//! This binary provides a command-line interface to the tilecatcher
//! library.
//!
//! # Architecture
//!
//! The CLI is organized into:
//! - `Cli` / `Commands`: argument parsing (clap)
//! - `commands`: one module per subcommand
//! - `CliError`: centralized error handling with user-friendly messages
//!
//! # Commands
//!
//! - `serve` - run both capture transports against the configured stores
//! - `send` - frame a TIFF from disk and send it over the socket protocol

mod commands;
mod error;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tilecatcher")]
#[command(version = tilecatcher::VERSION)]
#[command(about = "Tile ingestion service for electron-microscopy capture", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion service (socket + HTTP transports)
    Serve {
        /// Configuration file (INI); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// HTTP server binding
        #[arg(long, default_value = "0.0.0.0:5001")]
        http_bind: String,

        /// Raw socket server binding
        #[arg(long, default_value = "0.0.0.0:16000")]
        tcp_bind: String,

        /// Directory for log files
        #[arg(long, default_value = "logs")]
        log_dir: String,
    },

    /// Send one tile over the socket protocol and print the response
    Send {
        /// Server address
        #[arg(long, default_value = "127.0.0.1:16000")]
        addr: String,

        /// Acquisition id to file the tile under
        #[arg(long)]
        acq_id: u64,

        /// Tile file; the name must follow one of the tile grammars
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            config,
            http_bind,
            tcp_bind,
            log_dir,
        } => commands::serve::run(config, &http_bind, &tcp_bind, &log_dir).await,
        Commands::Send { addr, acq_id, file } => commands::send::run(&addr, acq_id, &file).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
