//! Change-set analysis for incremental runs.
//!
//! A resolver walks the change records of one run, keeps the target tree in
//! sync for everything that is not re-processed by the engine, and returns the
//! explicit file list the engine should transform.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::change::{ChangeKind, ChangeRecord, class_file_base_name, is_class_file, relative_name};
use crate::source::walk_files;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalResolution {
    /// Class-file base names whose whole group is re-processed.
    pub reprocess_roots: BTreeSet<String>,
    /// Absolute source files handed to the engine, in discovery order.
    pub files: Vec<PathBuf>,
    /// Absolute target files deleted while preparing the run.
    pub purged: Vec<PathBuf>,
}

pub trait IncrementalResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(
        &self,
        changes: &[ChangeRecord],
        source_root: &Path,
        target_root: &Path,
    ) -> Result<IncrementalResolution>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IncrementalStrategy {
    #[default]
    RootWidening,
    LiteralChangeSet,
}

impl IncrementalStrategy {
    pub fn resolver(self) -> Box<dyn IncrementalResolver> {
        match self {
            Self::RootWidening => Box::new(ForOuterClasses),
            Self::LiteralChangeSet => Box::new(ForChangedFiles),
        }
    }
}

/// Re-processes every class file that shares a base name with a changed
/// class file and purges the target of that group's stale siblings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForOuterClasses;

impl IncrementalResolver for ForOuterClasses {
    fn name(&self) -> &'static str {
        "rootWidening"
    }

    fn resolve(
        &self,
        changes: &[ChangeRecord],
        source_root: &Path,
        target_root: &Path,
    ) -> Result<IncrementalResolution> {
        ensure_distinct(source_root, target_root)?;
        let mut resolution = IncrementalResolution::default();

        for change in changes {
            if change.file.is_dir() {
                continue;
            }
            let Some(name) = relative_name(source_root, &change.file) else {
                tracing::debug!(file = %change.file.display(), "Ignoring change outside of source root");
                continue;
            };
            if let Some(base) = class_file_base_name(&name) {
                resolution.reprocess_roots.insert(base.to_string());
            } else if change.kind == ChangeKind::Removed {
                let target = resolve_under(target_root, &name);
                if delete_if_exists(&target)? {
                    tracing::debug!(file = %target.display(), "Deleted removed resource or folder");
                    resolution.purged.push(target);
                }
            } else {
                let target = resolve_under(target_root, &name);
                copy_resource(&change.file, &target)?;
            }
        }

        tracing::info!(
            "Found {} roots: {:?}",
            resolution.reprocess_roots.len(),
            resolution.reprocess_roots
        );
        if resolution.reprocess_roots.is_empty() {
            return Ok(resolution);
        }

        for file in walk_files(source_root) {
            let file = file?;
            if in_roots(source_root, &file, &resolution.reprocess_roots) {
                resolution.files.push(file);
            }
        }

        if target_root.is_dir() {
            let stale = walk_files(target_root)
                .filter(|file| match file {
                    Ok(file) => in_roots(target_root, file, &resolution.reprocess_roots),
                    Err(_) => true,
                })
                .collect::<Result<Vec<_>>>()?;
            for file in stale {
                std::fs::remove_file(&file).with_context(|| {
                    format!("Cannot delete file {} in target folder", file.display())
                })?;
                resolution.purged.push(file);
            }
        }

        Ok(resolution)
    }
}

/// Hands the change records to the engine as they are, without widening.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForChangedFiles;

impl IncrementalResolver for ForChangedFiles {
    fn name(&self) -> &'static str {
        "literalChangeSet"
    }

    fn resolve(
        &self,
        changes: &[ChangeRecord],
        source_root: &Path,
        target_root: &Path,
    ) -> Result<IncrementalResolution> {
        ensure_distinct(source_root, target_root)?;
        let mut resolution = IncrementalResolution::default();

        for change in changes {
            if change.file.is_dir() {
                continue;
            }
            let Some(name) = relative_name(source_root, &change.file) else {
                tracing::debug!(file = %change.file.display(), "Ignoring change outside of source root");
                continue;
            };
            if let Some(base) = class_file_base_name(&name) {
                resolution.reprocess_roots.insert(base.to_string());
            }
            if change.kind == ChangeKind::Removed {
                let target = resolve_under(target_root, &name);
                if delete_if_exists(&target)? {
                    tracing::debug!(file = %target.display(), "Deleted removed file to prepare incremental build");
                    resolution.purged.push(target);
                }
            } else {
                resolution.files.push(change.file.clone());
            }
        }

        Ok(resolution)
    }
}

fn ensure_distinct(source_root: &Path, target_root: &Path) -> Result<()> {
    if same_directory(source_root, target_root) {
        bail!(
            "Source and target folder cannot be equal: {}",
            source_root.display()
        );
    }
    Ok(())
}

pub fn same_directory(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn in_roots(root: &Path, file: &Path, roots: &BTreeSet<String>) -> bool {
    relative_name(root, file)
        .as_deref()
        .filter(|name| is_class_file(name))
        .and_then(class_file_base_name)
        .is_some_and(|base| roots.contains(base))
}

fn resolve_under(root: &Path, name: &str) -> PathBuf {
    name.split('/').fold(root.to_path_buf(), |path, segment| path.join(segment))
}

/// Deletes a file or, for a removed package folder, the whole subtree.
fn delete_if_exists(path: &Path) -> Result<bool> {
    let removed = match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) => Err(err),
    };
    match removed {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

fn copy_resource(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::copy(from, to).with_context(|| {
        format!("Failed to copy {} -> {}", from.display(), to.display())
    })?;
    Ok(())
}
