mod app;
mod bridge;
mod cache;
mod config;
mod connectivity;
mod conversation;
mod event;
mod logging;
mod notify;
mod protocol;
mod query;
mod worker;

#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chatrex")]
#[command(about = "Offline cache and sync layer for the chatrex chat client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/chatrex/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Follow a conversation, falling back to cached messages while offline
  Watch { conversation_id: String },
  /// Perform one request through the cache manager
  Fetch {
    path: String,
    /// Request as a page navigation (offline page fallback)
    #[arg(long)]
    html: bool,
  },
  /// Show the cached snapshot of a conversation
  Messages { conversation_id: String },
  /// List cache stores and their entries
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init()?;

  let config = config::Config::load(args.config.as_deref())?;
  let app = app::App::new(config).await?;

  match args.command {
    Command::Watch { conversation_id } => app.watch(&conversation_id).await?,
    Command::Fetch { path, html } => app.fetch(&path, html).await?,
    Command::Messages { conversation_id } => app.messages(&conversation_id).await?,
    Command::Caches => app.caches()?,
  }

  Ok(())
}
