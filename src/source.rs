//! Source views over raw class-file trees and the folder target the engine
//! writes into.
//!
//! A view yields [`Element`]s that all share one root. Views are consumed by
//! iteration, so the engine can only walk a source once.

use anyhow::{Context, Result, anyhow};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::change::relative_name;

#[derive(Debug, Clone)]
pub struct Element {
    root: Arc<Path>,
    path: PathBuf,
    name: String,
}

impl Element {
    pub fn for_file(root: Arc<Path>, path: PathBuf) -> Result<Self> {
        let name = relative_name(&root, &path).ok_or_else(|| {
            anyhow!(
                "{} is not located in source root {}",
                path.display(),
                root.display()
            )
        })?;
        Ok(Self { root, path, name })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root-relative identity with `/` separators.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path)
            .with_context(|| format!("Failed to read source element: {}", self.path.display()))
    }
}

pub type Elements = Box<dyn Iterator<Item = Result<Element>>>;

#[derive(Debug, Clone)]
pub enum SourceView {
    /// Every regular file below the root, scanned lazily.
    Folder { root: Arc<Path> },
    /// An explicit file list resolved against a fixed root, in list order.
    Explicit { root: Arc<Path>, files: Vec<PathBuf> },
}

impl SourceView {
    pub fn folder(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        Self::Folder {
            root: Arc::from(root),
        }
    }

    pub fn explicit(root: impl Into<PathBuf>, files: Vec<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        Self::Explicit {
            root: Arc::from(root),
            files,
        }
    }

    pub fn root(&self) -> &Path {
        match self {
            Self::Folder { root } | Self::Explicit { root, .. } => root,
        }
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Explicit { .. })
    }

    /// An explicit view over no files. Folder views are never known to be
    /// empty before they are scanned.
    pub fn is_known_empty(&self) -> bool {
        matches!(self, Self::Explicit { files, .. } if files.is_empty())
    }

    pub fn into_elements(self) -> Elements {
        match self {
            Self::Folder { root } => {
                let walk_root = root.to_path_buf();
                Box::new(
                    walk_files(&walk_root)
                        .map(move |file| file.and_then(|f| Element::for_file(Arc::clone(&root), f))),
                )
            }
            Self::Explicit { root, files } => Box::new(
                files
                    .into_iter()
                    .map(move |file| Element::for_file(Arc::clone(&root), file)),
            ),
        }
    }
}

/// Lazily walks every regular file under `root` in file-name order.
pub fn walk_files(root: &Path) -> impl Iterator<Item = Result<PathBuf>> + use<> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    walker.filter_map(|entry| match entry {
        Ok(entry) => {
            if entry.file_type().is_some_and(|t| t.is_file()) {
                Some(Ok(entry.into_path()))
            } else {
                None
            }
        }
        Err(err) => Some(Err(anyhow::Error::new(err).context("Failed to scan directory"))),
    })
}

/// The engine's output folder. Writes go through one lock so concurrent
/// workers never interleave on the same tree operation.
#[derive(Debug)]
pub struct TargetFolder {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl TargetFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(name);
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("Target folder lock poisoned"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write target file: {}", path.display()))
    }

    /// Copies the element's original bytes to the target unchanged.
    pub fn retain(&self, element: &Element) -> Result<()> {
        let bytes = element.read()?;
        self.store(element.name(), &bytes)
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        name.split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}
