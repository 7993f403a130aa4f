//! Thin CLI front end for the Stream Manager (SPEC_FULL.md §A): boots a
//! [`manager::Manager`], wires up logging, and exposes a handful of
//! subcommands over its in-process API. Not the HTTP/WebSocket API surface
//! (out of scope per spec.md §1) — this is a local operator/dev tool,
//! grounded in the teacher's thin `cli` crate talking to its daemon.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use manager::{BuildResult, IndexBuilder, Manager};
use streamcore::config::Config;
use streamcore::{IndexReader, StreamId};
use tracing_subscriber::EnvFilter;

/// The real PCAP parser/index builder is an external collaborator (spec.md
/// §1, §6) outside this crate's scope. This stand-in lets the scheduler
/// boot and answer tag/status/converter queries against whatever indexes
/// are already on disk from a prior run; `streamctl import` surfaces the
/// gap loudly rather than silently doing nothing.
struct UnimplementedBuilder;

impl IndexBuilder for UnimplementedBuilder {
  fn build(&self, _files: &[PathBuf], _next_stream_id: StreamId) -> std::io::Result<BuildResult> {
    Err(std::io::Error::other(
      "no pcap builder wired up: streamctl links against the manager core only; plug in a real IndexBuilder to import captures",
    ))
  }

  fn merge(&self, _indexes: &[Arc<dyn IndexReader>]) -> std::io::Result<Vec<Arc<dyn IndexReader>>> {
    Err(std::io::Error::other("no pcap builder wired up: cannot merge indexes"))
  }
}

#[derive(Parser)]
#[command(name = "streamctl")]
#[command(about = "Operator CLI for the Stream Manager")]
struct Cli {
  /// Path to a stream-manager.toml config file (falls back to the user
  /// config dir, then compiled defaults).
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Show scheduler status: stream/index/tag/converter counts and job flags.
  Status,
  /// Import a pcap file.
  Import {
    /// Path to the capture file.
    path: PathBuf,
  },
  /// Manage tags.
  Tags {
    #[command(subcommand)]
    command: commands::TagsCommand,
  },
  /// Manage converters.
  Converters {
    #[command(subcommand)]
    command: commands::ConvertersCommand,
  },
  /// Restart the filter subprocess.
  RestartFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())).init();

  let cli = Cli::parse();
  let config = Config::load(cli.config.as_deref());
  let manager = Manager::spawn(config, Arc::new(UnimplementedBuilder));

  let result = match cli.command {
    Commands::Status => commands::status(&manager).await,
    Commands::Import { path } => commands::import(&manager, path).await,
    Commands::Tags { command } => commands::tags(&manager, command).await,
    Commands::Converters { command } => commands::converters(&manager, command).await,
    Commands::RestartFilter => commands::restart_filter(&manager).await,
  };

  let close_result = manager.close().await;
  result?;
  close_result?;
  Ok(())
}
