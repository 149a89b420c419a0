use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::config::AnalyzeConfig;
use crate::history::{HistoryStore, ImageHistoryEntry};
use crate::image::InspectInfo;
use crate::image::manifest::Digest;
use crate::progress::Spinner;
use crate::task::{Collaborators, Task, TaskState};
use crate::tree::{DirectoryNode, LayerSet};

/// Result of a one-shot analysis.
#[derive(Debug, Serialize)]
struct Report {
    image: String,
    inspect_info: InspectInfo,
    layers: LayerSet,
}

/// Either the report or why there is none: `{"ok": ...}` or `{"error": ...}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome<T> {
    Ok(T),
    Error(String),
}

pub async fn run(config: AnalyzeConfig) -> Result<()> {
    let collaborators = Collaborators::layout(&config.analysis.store_dir);
    let task = Task::new(
        Uuid::new_v4().to_string(),
        &config.image,
        &config.analysis.scratch_dir(),
        config.analysis.task_timeout(),
    )
    .with_context(|| format!("Cannot analyze {}", config.image))?;

    drive(&task, &collaborators).await?;

    let outcome = match task.state() {
        TaskState::Finished => Outcome::Ok(Report {
            image: task.image().raw.clone(),
            inspect_info: task.inspect_info().unwrap_or_default(),
            layers: task.result()?,
        }),
        TaskState::Error => Outcome::Error(task.error().unwrap_or_default()),
        state => Outcome::Error(format!(
            "analysis abandoned while {}",
            state.description().to_lowercase()
        )),
    };

    if let Err(e) = task.cleanup() {
        warn!(path = %task.scratch_dir().display(), error = %e, "failed to remove scratch directory");
    }

    if let (Some(db), Outcome::Ok(report)) = (&config.save, &outcome) {
        save(db, config.name.as_deref(), report)?;
    }

    if let Some(dest) = config.json.as_deref() {
        let output = serde_json::to_string_pretty(&outcome)?;
        if dest == "-" {
            println!("{output}");
        } else {
            fs::write(dest, &output).with_context(|| format!("Failed to write JSON to {dest}"))?;
            eprintln!("{} Wrote {}", "✔".green(), style::style(dest).cyan());
        }
    } else if let Outcome::Ok(report) = &outcome {
        print_report(report, &config.dir, config.top);
    }

    match outcome {
        Outcome::Ok(_) => Ok(()),
        Outcome::Error(message) => anyhow::bail!(message),
    }
}

/// Process the task while keeping the spinner current. Ctrl-c cancels the
/// task instead of killing the process, so the scratch directory is removed.
async fn drive(task: &Task, collaborators: &Collaborators) -> Result<()> {
    let spinner = Spinner::new(format!("Analyzing {} ...", task.image().raw));
    let processing = task.process(collaborators);
    tokio::pin!(processing);
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut interrupted = false;

    loop {
        tokio::select! {
            result = &mut processing => {
                result?;
                break;
            }
            _ = ticker.tick() => spinner.set_message(status_line(task)),
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                task.cancel();
                spinner.set_message("Cancelling ...");
            }
        }
    }

    match task.state() {
        TaskState::Finished => {
            let layers = task.result().map(|l| l.len()).unwrap_or_default();
            spinner.finish(format!("Analyzed {layers} layers of {}", task.image().raw));
        }
        TaskState::Error => spinner.fail(format!(
            "Analysis of {} failed: {}",
            task.image().raw,
            task.error().unwrap_or_default()
        )),
        state => spinner.fail(format!("Abandoned while {}", state.description().to_lowercase())),
    }
    Ok(())
}

fn status_line(task: &Task) -> String {
    let state = task.state();
    let (done, total) = task.progress().totals();
    if state == TaskState::Pulling && total > 0 {
        format!("{state} [{} / {}]", format_bytes(done), format_bytes(total))
    } else {
        format!("{state} ...")
    }
}

fn save(db: &Path, name: Option<&str>, report: &Report) -> Result<()> {
    let info = report.inspect_info.clone();
    let name = name.unwrap_or(info.name.as_str()).to_string();
    let digest = info.digest.clone();
    let entry = ImageHistoryEntry::new(vec![info.tag.clone()], report.layers.clone(), info);

    let store = HistoryStore::open(db)
        .with_context(|| format!("Failed to open database {}", db.display()))?;
    let saved = store
        .record(&name, &digest, entry)
        .with_context(|| format!("Failed to save history of {name}"))?;

    eprintln!(
        "{} Saved {} to {} (image id {})",
        "✔".green(),
        style::style(&name).bold(),
        style::style(db.display()).cyan(),
        saved.id.unwrap_or_default()
    );
    Ok(())
}

fn print_report(report: &Report, dir: &str, top: usize) {
    let info = &report.inspect_info;
    println!("{}:{}", info.name, info.tag);
    println!("  digest: {}", info.digest);
    if let (Some(os), Some(arch)) = (&info.os, &info.architecture) {
        println!("  platform: {os}/{arch}");
    }
    let total: u64 = report.layers.values().map(|l| l.total_size()).sum();
    println!("  total size: {}", format_bytes(total));
    println!();

    for (hex, digest) in layer_order(info, &report.layers) {
        let Some(layer) = report.layers.get(&hex) else {
            continue;
        };
        println!(
            "{} {} in {} files",
            style::style(digest).bold(),
            format_bytes(layer.total_size()).dim(),
            layer.root.file_count()
        );
        if !layer.created_by.is_empty() {
            println!("  {}", layer.created_by.as_str().dim());
        }
        if let Some(node) = layer.root.directory(dir) {
            for (name, size) in largest_entries(node, top) {
                println!("  {:>10}  {name}", format_bytes(size));
            }
        }
        println!();
    }
}

/// `(key, digest)` of each layer, base first as listed by the image, then
/// any others under their bare key.
fn layer_order(info: &InspectInfo, layers: &LayerSet) -> Vec<(String, String)> {
    let mut order: Vec<(String, String)> = info
        .layers
        .iter()
        .filter_map(|raw| {
            let hex = Digest::parse(raw).ok()?.hex().to_string();
            layers.contains_key(&hex).then(|| (hex, raw.clone()))
        })
        .collect();
    for hex in layers.keys() {
        if !order.iter().any(|(key, _)| key == hex) {
            order.push((hex.clone(), hex.clone()));
        }
    }
    order
}

/// The `n` biggest direct children of `node`, directories with a trailing
/// slash.
fn largest_entries(node: &DirectoryNode, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = node
        .subdirs
        .iter()
        .map(|(name, dir)| (format!("{name}/"), dir.total_size))
        .chain(node.files.iter().map(|(name, size)| (name.clone(), *size)))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return if size.fract() < 0.05 {
                format!("{:.0} {unit}", size)
            } else {
                format!("{:.1} {unit}", size)
            };
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}
