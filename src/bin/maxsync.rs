//! Operator CLI over the state core: diff and merge saved sessions,
//! inspect parts of one, or replay a log of change descriptors.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

use maxsync::persistence::METADATA_KEY;
use maxsync::{compute_diff, conflict, persistence, responder, Category, EngineConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "maxsync")]
#[command(about = "Inspect and reconcile Max session state files")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Structural diff between two session files
    Diff { base: PathBuf, current: PathBuf },
    /// Merge a remote session file into a local one
    Resolve {
        local: PathBuf,
        remote: PathBuf,
        #[arg(short, long, default_value = "timestamp")]
        strategy: String,
        /// Write the merged session here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a snapshot of a saved session, optionally one category or entity
    Inspect {
        path: PathBuf,
        #[arg(short, long)]
        category: Option<String>,
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Apply newline-delimited change descriptors and print the resulting events
    Replay {
        /// JSON lines of `{category, eventType, targetId, data}`
        changes: PathBuf,
        /// Start from this saved session instead of a fresh one
        #[arg(long)]
        from: Option<PathBuf>,
        /// Save the final session here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Engine configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeLine {
    category: String,
    event_type: String,
    #[serde(alias = "objectId")]
    target_id: String,
    #[serde(default)]
    data: Value,
}

/// A session document from disk, without its envelope.
fn read_document(path: &Path) -> anyhow::Result<Value> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut doc: Value =
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))?;
    if let Some(map) = doc.as_object_mut() {
        map.remove(METADATA_KEY);
    }
    Ok(doc)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn replay(
    changes: &Path,
    from: Option<&Path>,
    output: Option<&Path>,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let engine = SyncEngine::new(config);
    match from {
        Some(path) => {
            engine.load("replay", path)?;
        }
        None => {
            engine.init();
        }
    }

    let file = std::fs::File::open(changes).with_context(|| format!("opening {}", changes.display()))?;
    let mut failures = 0;
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let change: ChangeLine =
            serde_json::from_str(&line).with_context(|| format!("line {}", n + 1))?;
        match engine.apply_change(&change.category, &change.event_type, &change.target_id, change.data) {
            Ok(Some(event)) => println!("{} {} {}", event.timestamp, event.address(), event.target_id),
            Ok(None) => log::info!("line {}: ignored", n + 1),
            Err(e) => {
                failures += 1;
                log::warn!("line {}: {} ({})", n + 1, e, e.kind());
            }
        }
    }

    if let Some(path) = output {
        let saved = engine.save("replay", Some(path))?;
        println!("saved {}", saved.path.display());
    }
    if failures > 0 {
        bail!("{} change(s) rejected", failures);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Diff { base, current } => {
            let diffs = compute_diff(&read_document(&base)?, &read_document(&current)?);
            print_json(&diffs)?;
        }
        Commands::Resolve { local, remote, strategy, output } => {
            let merged = conflict::resolve(&read_document(&local)?, &read_document(&remote)?, &strategy);
            match output {
                Some(path) => {
                    let session = maxsync::Session::from_document(&merged)?;
                    let receipt = persistence::write_session(&session, &path)?;
                    println!("saved {}", receipt.path.display());
                }
                None => print_json(&merged)?,
            }
        }
        Commands::Inspect { path, category, target } => {
            let session = persistence::read_session(&path)?;
            let category = category.as_deref().map(str::parse::<Category>).transpose()?;
            print_json(&responder::full_snapshot(&session, category, target.as_deref())?)?;
        }
        Commands::Replay { changes, from, output, config } => {
            replay(&changes, from.as_deref(), output.as_deref(), config.as_deref())?;
        }
    }

    Ok(())
}
