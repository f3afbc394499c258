//! Inspection commands: available mechanisms and metadata snapshots

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use dirwatch_core::{BackendMode, DirWatchEngine, FsProbe, MetadataProbe, WatchConfig};
use std::path::Path;

/// Print every mechanism the engine knows and whether this host offers it
pub fn list_backends(config: WatchConfig) -> Result<()> {
    let preferred = config.preferred_backend.mode();
    let engine = DirWatchEngine::new(config)?;
    let available = engine.available_backends();

    println!("Notification mechanisms (in fallback order):");
    let order = BackendMode::EVENT_PRECEDENCE.into_iter().chain([BackendMode::Polling]);
    for mode in order {
        let state = if available.contains(&mode) { "available" } else { "unavailable" };
        let marker = if mode == preferred { " (preferred)" } else { "" };
        println!("  {:<16} {}{}", mode.to_string(), state, marker);
    }
    Ok(())
}

/// Print the metadata the engine compares between scans
pub fn stat(path: &Path) -> Result<()> {
    let path = dirwatch_core::entry::normalize_path(path)?;
    let meta = FsProbe.read_metadata(&path).with_context(|| format!("Failed to stat {}", path.display()))?;

    let Some(meta) = meta else {
        println!("{}: does not exist", path.display());
        return Ok(());
    };

    println!("{}", path.display());
    println!("  type:       {}", if meta.is_dir { "directory" } else { "file" });
    match meta.modified {
        Some(time) => println!("  modified:   {}", DateTime::<Local>::from(time).format("%Y-%m-%d %H:%M:%S%.3f")),
        None => println!("  modified:   unknown"),
    }
    println!("  inode:      {}", meta.inode);
    println!("  links:      {}", meta.link_count);

    if meta.is_dir {
        let children = FsProbe.read_dir(&path)?;
        println!("  children:   {}", children.len());
    }
    Ok(())
}
