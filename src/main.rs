use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;
use mimalloc::MiMalloc;

use chat_mirror::prelude::*;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "chat-mirror",
          about = "Mirrors a Messages database into a local store and derives conversations over it")]
struct Cli {
    /// Internal store database file.
    #[arg(long, default_value = "chat-mirror.sqlite")]
    db: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// One-shot import of an iPhone backup directory.
    Backup {
        /// Backup directory containing Manifest.db.
        dir: PathBuf,
    },
}

/** Runs the initial live import and the watcher by default. */
#[tokio::main]
async fn main() -> EmptyRes {
    env_logger::Builder::new()
        .filter(None, LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Backup { dir }) => chat_mirror::run_backup_import(&cli.db, &dir),
        None => chat_mirror::run_live_sync(&cli.db).await,
    }
}
