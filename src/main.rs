use anyhow::{Context, Result, bail};
use clap::Parser;
use class_transform::change::{ChangeRecord, InputChanges};
use class_transform::cli::{Cli, Commands};
use class_transform::config::{resolve_state_path, resolve_task_config};
use class_transform::error::TaskError;
use class_transform::plugin::PluginRegistry;
use class_transform::registration::{SourceSetLayout, TaskGraph};
use class_transform::state::{self, StateStore};
use class_transform::task::TransformationTask;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Run { full, changes, .. } => run(&cli, full, changes.as_deref()),
        Commands::Plugins => {
            let registry = PluginRegistry::builtin();
            println!("{}", serde_json::to_string_pretty(&registry.listing())?);
            Ok(())
        }
        Commands::Layout {
            classes_dir,
            source_set,
            dependents,
        } => {
            let layout = SourceSetLayout::of(&source_set, &classes_dir);
            let mut graph = TaskGraph::new();
            for dependent in &dependents {
                graph.depends_on(dependent, &layout.compile_task);
            }
            let rewired = graph.register(&layout);
            println!(
                "{}",
                serde_json::to_string_pretty(&LayoutOutput {
                    layout: &layout,
                    rewired,
                    graph: &graph,
                })?
            );
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct LayoutOutput<'a> {
    layout: &'a SourceSetLayout,
    rewired: Vec<String>,
    graph: &'a TaskGraph,
}

#[derive(Serialize)]
struct FailureOutput<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed: Option<&'a std::collections::BTreeMap<String, Vec<String>>>,
}

fn run(cli: &Cli, full: bool, changes_file: Option<&Path>) -> Result<()> {
    let start = Instant::now();
    let config = resolve_task_config(cli)?;
    config.validate()?;

    let snapshot = if config.incremental {
        let store = StateStore::open(&resolve_state_path(cli)?)?;
        let fingerprint = state::fingerprint(&config)?;
        let (source, target) = match (&config.source, &config.target) {
            (Some(source), Some(target)) => (source, target),
            _ => bail!("Source and target folder must be set"),
        };
        let (detected, snapshot) = store.detect_changes(source, target, &fingerprint)?;
        Some((store, detected, snapshot))
    } else {
        None
    };

    let changes = match (changes_file, full, &snapshot) {
        (Some(path), _, _) => read_changes(path)?,
        (None, true, _) => InputChanges::full(),
        (None, false, Some((_, detected, _))) => detected.clone(),
        (None, false, None) => InputChanges::full(),
    };
    debug!(
        "Running {} with {} change records",
        if changes.incremental { "incrementally" } else { "in full" },
        changes.changes.len()
    );

    let task = TransformationTask::new(config, Arc::new(PluginRegistry::builtin()));
    match task.run(&changes) {
        Ok(summary) => {
            if let Some((store, _, snapshot)) = &snapshot {
                store.commit(snapshot)?;
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
            info!("Completed in {:?}", start.elapsed());
            Ok(())
        }
        Err(err) => {
            if let Some((store, _, _)) = &snapshot
                && let Some(source) = &task.config().source
            {
                store.invalidate(source)?;
            }
            let failed = match &err {
                TaskError::TransformationFailed { failed, .. } => Some(failed),
                _ => None,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&FailureOutput {
                    error: error_chain(&err),
                    failed,
                })?
            );
            Err(err.into())
        }
    }
}

fn error_chain(err: &TaskError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    message
}

fn read_changes(path: &Path) -> Result<InputChanges> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read change list: {}", path.display()))?;
    let records: Vec<ChangeRecord> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse change list: {}", path.display()))?;
    Ok(InputChanges::incremental(records))
}
