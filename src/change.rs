use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

pub const CLASS_FILE_EXTENSION: &str = ".class";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub file: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    pub fn new(file: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            file: file.into(),
            kind,
        }
    }
}

/// The change stream handed to a task run.
///
/// `incremental` is the caller's signal that `changes` is a complete delta
/// against the previous successful run; when it is `false` the records are
/// ignored and the task rebuilds everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputChanges {
    pub incremental: bool,
    pub changes: Vec<ChangeRecord>,
}

impl InputChanges {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn incremental(changes: Vec<ChangeRecord>) -> Self {
        Self {
            incremental: true,
            changes,
        }
    }
}

/// Truncates a class-file path at its first `$` (or its `.class` suffix) so
/// that inner classes group with their declaring class.
pub fn class_file_base_name(name: &str) -> Option<&str> {
    if !name.ends_with(CLASS_FILE_EXTENSION) {
        return None;
    }
    let file_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    let end = match name[file_start..].find('$') {
        Some(pos) => file_start + pos,
        None => name.len() - CLASS_FILE_EXTENSION.len(),
    };
    Some(&name[..end])
}

/// Root-relative path of `file` with `/` separators, or `None` when `file`
/// does not live under `root`. Relative and absolute spellings of the same
/// location are compared after normalization.
pub fn relative_name(root: &Path, file: &Path) -> Option<String> {
    let relative = match file.strip_prefix(root) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => normalized_relative(root, file)?,
    };
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn normalized_relative(root: &Path, file: &Path) -> Option<PathBuf> {
    let (root, file) = (normalize(root)?, normalize(file)?);
    if let Ok(relative) = file.strip_prefix(&root) {
        return Some(relative.to_path_buf());
    }
    // Symlinked roots only line up once resolved on disk.
    let root = root.canonicalize().ok()?;
    let file = canonicalize_existing(&file)?;
    file.strip_prefix(&root).ok().map(Path::to_path_buf)
}

/// Absolute form of `path` with `.` and `..` folded away lexically.
fn normalize(path: &Path) -> Option<PathBuf> {
    let absolute = std::path::absolute(path).ok()?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Some(normalized)
}

/// Resolves the deepest existing ancestor of `path` and re-appends the rest,
/// so removed files still map through a symlinked root.
fn canonicalize_existing(path: &Path) -> Option<PathBuf> {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(resolved) = current.canonicalize() {
            return Some(missing.iter().rev().fold(resolved, |path, part| path.join(part)));
        }
        missing.push(current.file_name()?.to_os_string());
        current = current.parent()?;
    }
}

pub fn is_class_file(name: &str) -> bool {
    name.ends_with(CLASS_FILE_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_groups_inner_classes_with_outer() {
        assert_eq!(class_file_base_name("a/Foo.class"), Some("a/Foo"));
        assert_eq!(class_file_base_name("a/Foo$1.class"), Some("a/Foo"));
        assert_eq!(class_file_base_name("a/Foo$Inner$Deep.class"), Some("a/Foo"));
        assert_eq!(class_file_base_name("Bar.class"), Some("Bar"));
        assert_eq!(class_file_base_name("a/README.txt"), None);
    }

    #[test]
    fn base_name_only_looks_at_file_segment() {
        assert_eq!(class_file_base_name("we$ird/Foo.class"), Some("we$ird/Foo"));
    }

    #[test]
    fn relative_name_uses_forward_slashes() {
        let root = Path::new("/tmp/raw");
        let file = root.join("a").join("b").join("Foo.class");
        assert_eq!(relative_name(root, &file).as_deref(), Some("a/b/Foo.class"));
        assert_eq!(relative_name(root, Path::new("/elsewhere/Foo.class")), None);
        assert_eq!(relative_name(root, root), None);
    }

    #[test]
    fn relative_name_matches_mixed_relative_and_absolute_spellings() -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let root = Path::new("build/classes/mainRaw");
        let file = cwd.join("build/classes/mainRaw/a/Foo.class");
        assert_eq!(relative_name(root, &file).as_deref(), Some("a/Foo.class"));
        assert_eq!(
            relative_name(&cwd.join("build/./classes/x/../mainRaw"), Path::new("build/classes/mainRaw/README.txt"))
                .as_deref(),
            Some("README.txt")
        );
        assert_eq!(relative_name(root, &cwd.join("build/classes/main/a/Foo.class")), None);
        Ok(())
    }

    #[test]
    fn change_kind_uses_upper_case_names() -> anyhow::Result<()> {
        let record: ChangeRecord =
            serde_json::from_str(r#"{"file": "/tmp/raw/a/Foo.class", "kind": "REMOVED"}"#)?;
        assert_eq!(record.kind, ChangeKind::Removed);
        Ok(())
    }
}
