//! One function per subcommand (teacher's `cli::commands` layout), each
//! taking a `&Manager` and returning an `anyhow::Result<()>`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use manager::{Manager, TagOp};
use streamcore::StreamId;

#[derive(Subcommand)]
pub enum TagsCommand {
  /// List all tags with their match/uncertain counts.
  List,
  /// Create a new tag.
  Add {
    /// Tag name, e.g. `tag/http`, `mark/favorites`.
    name: String,
    /// Query definition string.
    definition: String,
    /// Hex color for the UI, e.g. `#ff0000`.
    #[arg(long, default_value = "#888888")]
    color: String,
  },
  /// Delete a tag.
  Del {
    name: String,
  },
  /// Add stream ids to a mark/generated tag.
  MarkAdd {
    name: String,
    ids: Vec<StreamId>,
  },
  /// Remove stream ids from a mark/generated tag.
  MarkDel {
    name: String,
    ids: Vec<StreamId>,
  },
  /// Change a tag's display color.
  SetColor {
    name: String,
    color: String,
  },
  /// Attach converters to a tag (replaces the current set).
  SetConverters {
    name: String,
    converters: Vec<String>,
  },
}

#[derive(Subcommand)]
pub enum ConvertersCommand {
  /// List registered converters.
  List,
  /// Reset a converter's cache file.
  Reset {
    name: String,
  },
  /// Fetch new stderr lines since a cursor (defaults to 0, i.e. from the start).
  Stderr {
    name: String,
    #[arg(long, default_value_t = 0)]
    cursor: u64,
  },
}

pub async fn status(manager: &Manager) -> Result<()> {
  let status = manager.status().await.context("fetching status")?;
  println!("streams:          {}", status.stream_count);
  println!("packets:          {}", status.packet_count);
  println!("indexes:          {}", status.index_count);
  println!("tags:             {}", status.tag_count);
  println!("converters:       {}", status.converter_count);
  println!("next_stream_id:   {}", status.next_stream_id);
  println!("import_running:     {}", status.import_running);
  println!("merge_job_running:   {}", status.merge_job_running);
  println!("tagging_job_running: {}", status.tagging_job_running);
  println!("converter_job_running: {}", status.converter_job_running);
  println!("pending_imports:  {}", status.pending_imports);
  Ok(())
}

pub async fn import(manager: &Manager, path: PathBuf) -> Result<()> {
  manager.import_pcap(path.clone()).await.with_context(|| format!("importing {}", path.display()))?;
  println!("queued import: {}", path.display());
  Ok(())
}

pub async fn tags(manager: &Manager, command: TagsCommand) -> Result<()> {
  match command {
    TagsCommand::List => {
      let tags = manager.list_tags().await.context("listing tags")?;
      for tag in tags {
        println!(
          "{:<24} matches={:<8} uncertain={:<8} color={} definition={}",
          tag.name,
          tag.matches.ones_count(),
          tag.uncertain.ones_count(),
          tag.color,
          tag.definition
        );
      }
    }
    TagsCommand::Add { name, definition, color } => {
      manager.add_tag(name.clone(), definition, color).await.with_context(|| format!("adding tag {name}"))?;
      println!("added {name}");
    }
    TagsCommand::Del { name } => {
      manager.del_tag(name.clone()).await.with_context(|| format!("deleting tag {name}"))?;
      println!("deleted {name}");
    }
    TagsCommand::MarkAdd { name, ids } => {
      manager.update_tag(name.clone(), TagOp::MarkAdd(ids)).await.with_context(|| format!("updating tag {name}"))?;
      println!("updated {name}");
    }
    TagsCommand::MarkDel { name, ids } => {
      manager.update_tag(name.clone(), TagOp::MarkDel(ids)).await.with_context(|| format!("updating tag {name}"))?;
      println!("updated {name}");
    }
    TagsCommand::SetColor { name, color } => {
      manager.update_tag(name.clone(), TagOp::SetColor(color)).await.with_context(|| format!("updating tag {name}"))?;
      println!("updated {name}");
    }
    TagsCommand::SetConverters { name, converters } => {
      manager
        .update_tag(name.clone(), TagOp::SetConverters(converters))
        .await
        .with_context(|| format!("updating tag {name}"))?;
      println!("updated {name}");
    }
  }
  Ok(())
}

pub async fn restart_filter(manager: &Manager) -> Result<()> {
  manager.restart_filter().await.context("restarting filter")?;
  println!("filter restart requested");
  Ok(())
}

pub async fn converters(manager: &Manager, command: ConvertersCommand) -> Result<()> {
  match command {
    ConvertersCommand::List => {
      let names = manager.list_converters().await.context("listing converters")?;
      for name in names {
        println!("{name}");
      }
    }
    ConvertersCommand::Reset { name } => {
      manager.reset_converter(name.clone()).await.with_context(|| format!("resetting converter {name}"))?;
      println!("reset {name}");
    }
    ConvertersCommand::Stderr { name, cursor } => {
      let (lines, next_cursor) = manager.converter_stderr(name.clone(), cursor).await.with_context(|| format!("reading stderr for {name}"))?;
      for line in lines {
        println!("{line}");
      }
      println!("# cursor={next_cursor}");
    }
  }
  Ok(())
}
