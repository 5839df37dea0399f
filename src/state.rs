//! Snapshot store used to derive change records between runs.
//!
//! Uses LMDB (via heed). For every source root it keeps the content hash of
//! each file seen by the last successful run plus a fingerprint of the task
//! inputs that are not tracked file by file.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::change::{ChangeKind, ChangeRecord, InputChanges, relative_name};
use crate::config::{Compatibility, TaskConfig, TransformationSpec};
use crate::engine::EntryPoint;
use crate::source::walk_files;

pub const FILES_DB: &str = "files";
pub const FINGERPRINTS_DB: &str = "fingerprints";

const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

type StrDb = Database<Str, Str>;

#[derive(Debug)]
pub struct StateStore {
    env: Env,
    files: StrDb,
    fingerprints: StrDb,
}

/// Hashes of a source tree taken before a run, committed once it succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    root: String,
    fingerprint: String,
    files: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl StateStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }

        let mut options = EnvOpenOptions::new();
        options.map_size(DEFAULT_MAP_SIZE);
        options.max_dbs(DEFAULT_MAX_DBS);
        // SAFETY: Default LMDB locking stays on; NO_SUB_DIR keeps the store a
        // single file at the configured path.
        let env = unsafe {
            options.flags(EnvFlags::NO_SUB_DIR);
            options
                .open(db_path)
                .with_context(|| format!("Failed to open state store: {}", db_path.display()))?
        };

        let mut wtxn = env.write_txn()?;
        let files = env.create_database::<Str, Str>(&mut wtxn, Some(FILES_DB))?;
        let fingerprints = env.create_database::<Str, Str>(&mut wtxn, Some(FINGERPRINTS_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            files,
            fingerprints,
        })
    }

    /// Compares `source` against the last committed snapshot. Falls back to
    /// a full run when there is no usable snapshot or `target` is missing.
    pub fn detect_changes(
        &self,
        source: &Path,
        target: &Path,
        fingerprint: &str,
    ) -> Result<(InputChanges, Snapshot)> {
        let root = root_key(source);
        let current = Snapshot {
            root: root.clone(),
            fingerprint: fingerprint.to_string(),
            files: hash_tree(source)?,
        };

        let rtxn = self.env.read_txn()?;
        let stored = self.fingerprints.get(&rtxn, &root)?.map(str::to_string);
        if stored.as_deref() != Some(fingerprint) {
            tracing::debug!("No matching snapshot for {root}, running in full");
            return Ok((InputChanges::full(), current));
        }
        if !target.is_dir() {
            tracing::debug!("Target {} is missing, running in full", target.display());
            return Ok((InputChanges::full(), current));
        }

        let mut previous = BTreeMap::new();
        let prefix = file_key(&root, "");
        for item in self.files.prefix_iter(&rtxn, &prefix)? {
            let (key, hash) = item?;
            previous.insert(key[prefix.len()..].to_string(), hash.to_string());
        }
        drop(rtxn);

        let mut changes = Vec::new();
        for (name, hash) in &current.files {
            match previous.get(name) {
                None => changes.push(ChangeRecord::new(source.join(name), ChangeKind::Added)),
                Some(old) if old != hash => {
                    changes.push(ChangeRecord::new(source.join(name), ChangeKind::Modified));
                }
                Some(_) => {}
            }
        }
        for name in previous.keys() {
            if !current.files.contains_key(name) {
                changes.push(ChangeRecord::new(source.join(name), ChangeKind::Removed));
            }
        }
        Ok((InputChanges::incremental(changes), current))
    }

    /// Replaces the stored snapshot for the snapshot's root in one write
    /// transaction.
    pub fn commit(&self, snapshot: &Snapshot) -> Result<()> {
        let prefix = file_key(&snapshot.root, "");
        let mut wtxn = self.env.write_txn()?;
        let stale: Vec<String> = self
            .files
            .prefix_iter(&wtxn, &prefix)?
            .map(|item| item.map(|(key, _)| key.to_string()))
            .collect::<std::result::Result<_, _>>()?;
        for key in &stale {
            self.files.delete(&mut wtxn, key)?;
        }
        for (name, hash) in &snapshot.files {
            self.files
                .put(&mut wtxn, &file_key(&snapshot.root, name), hash)?;
        }
        self.fingerprints
            .put(&mut wtxn, &snapshot.root, &snapshot.fingerprint)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Drops the fingerprint so the next run is a full one.
    pub fn invalidate(&self, source: &Path) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.fingerprints.delete(&mut wtxn, &root_key(source))?;
        wtxn.commit()?;
        Ok(())
    }
}

fn root_key(source: &Path) -> String {
    std::fs::canonicalize(source)
        .unwrap_or_else(|_| source.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn file_key(root: &str, name: &str) -> String {
    format!("{root}::{name}")
}

fn hash_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    if !root.is_dir() {
        return Ok(files);
    }
    for file in walk_files(root) {
        let file = file?;
        let Some(name) = relative_name(root, &file) else {
            continue;
        };
        let bytes = std::fs::read(&file)
            .with_context(|| format!("Failed to hash {}", file.display()))?;
        files.insert(name, hex::encode(Sha256::digest(&bytes)));
    }
    Ok(files)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintInput<'a> {
    target: Option<&'a Path>,
    transformations: &'a [TransformationSpec],
    entry_point: EntryPoint,
    suffix: &'a str,
    extended_parsing: bool,
    target_compatibility: Option<&'a Compatibility>,
    class_path: Vec<ClassPathStamp>,
}

#[derive(Serialize)]
struct ClassPathStamp {
    path: PathBuf,
    len: u64,
    modified: u128,
}

/// Digest of every task input that can change the output without changing
/// a source file. Class-path entries contribute their size and modification
/// time.
pub fn fingerprint(config: &TaskConfig) -> Result<String> {
    let class_path = config
        .class_path_entries()
        .into_iter()
        .map(|path| {
            let (len, modified) = match std::fs::metadata(&path) {
                Ok(meta) => (
                    meta.len(),
                    meta.modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_nanos())
                        .unwrap_or_default(),
                ),
                Err(_) => (0, 0),
            };
            ClassPathStamp {
                path,
                len,
                modified,
            }
        })
        .collect();
    let input = FingerprintInput {
        target: config.target.as_deref(),
        transformations: &config.transformations,
        entry_point: config.entry_point(),
        suffix: &config.suffix,
        extended_parsing: config.extended_parsing,
        target_compatibility: config.target_compatibility.as_ref(),
        class_path,
    };
    let json = serde_json::to_vec(&input)?;
    Ok(hex::encode(Sha256::digest(&json)))
}
