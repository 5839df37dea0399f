//! Wiring of the transformer into a build: the compiler writes into a raw
//! directory, the transformer reads from there and writes into the original
//! classes directory, and every consumer of the compiler also waits for the
//! transformer.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const MAIN_SOURCE_SET: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSetLayout {
    pub source_set: String,
    pub task_name: String,
    pub compile_task: String,
    /// Where the compiler is redirected to; the transformer's source.
    pub raw_dir: PathBuf,
    /// The original classes directory; the transformer's target.
    pub target_dir: PathBuf,
}

impl SourceSetLayout {
    pub fn of(source_set: &str, classes_dir: &Path) -> Self {
        let raw_name = format!("{source_set}Raw");
        let raw_dir = match classes_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(raw_name),
            _ => classes_dir.join("..").join(raw_name),
        };
        Self {
            source_set: source_set.to_string(),
            task_name: transformer_task_name(source_set),
            compile_task: compile_task_name(source_set),
            raw_dir,
            target_dir: classes_dir.to_path_buf(),
        }
    }
}

pub fn transformer_task_name(source_set: &str) -> String {
    if source_set == MAIN_SOURCE_SET {
        "byteBuddy".to_string()
    } else {
        format!("{source_set}ByteBuddy")
    }
}

pub fn compile_task_name(source_set: &str) -> String {
    if source_set == MAIN_SOURCE_SET {
        "compileJava".to_string()
    } else {
        format!("compile{}Java", capitalize(source_set))
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Task name to the names of the tasks it depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TaskGraph {
    tasks: BTreeMap<String, BTreeSet<String>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depends_on(&mut self, task: &str, dependency: &str) -> &mut Self {
        self.tasks
            .entry(task.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.tasks.entry(dependency.to_string()).or_default();
        self
    }

    pub fn dependencies(&self, task: &str) -> Option<&BTreeSet<String>> {
        self.tasks.get(task)
    }

    /// Inserts the layout's transformer after its compile task. Returns the
    /// tasks that were made to depend on the transformer.
    pub fn register(&mut self, layout: &SourceSetLayout) -> Vec<String> {
        let dependents: Vec<String> = self
            .tasks
            .iter()
            .filter(|(task, dependencies)| {
                **task != layout.task_name && dependencies.contains(&layout.compile_task)
            })
            .map(|(task, _)| task.clone())
            .collect();
        self.depends_on(&layout.task_name, &layout.compile_task);
        for task in &dependents {
            self.depends_on(task, &layout.task_name);
        }
        dependents
    }
}
