//! Class-file lookup over class-path entries.
//!
//! Folders and archives are wrapped behind [`ClassFileLocator`] and composed
//! into a first-hit [`Compound`] in class-path order. Locators are read-only
//! once built, so workers may query them concurrently.

use anyhow::{Context, Result, anyhow};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zip::ZipArchive;
use zip::result::ZipError;

pub trait ClassFileLocator: Send + Sync {
    /// Returns the raw bytes of a resource such as `a/b/Foo.class`.
    fn resource(&self, path: &str) -> Result<Option<Vec<u8>>>;

    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Looks up a type by binary name (`a.b.Foo` or `a/b/Foo`).
    fn locate(&self, type_name: &str) -> Result<Option<Vec<u8>>> {
        self.resource(&class_name_to_class_path(type_name))
    }
}

pub fn class_name_to_class_path(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

#[derive(Debug, Clone)]
pub struct ForFolder {
    root: PathBuf,
}

impl ForFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ClassFileLocator for ForFolder {
    fn resource(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let file = path
            .split('/')
            .fold(self.root.clone(), |file, segment| file.join(segment));
        if !file.is_file() {
            return Ok(None);
        }
        std::fs::read(&file)
            .map(Some)
            .with_context(|| format!("Failed to read class file: {}", file.display()))
    }
}

/// An archive entry of the class path. The archive is memory mapped and its
/// central directory read once at open; both are dropped on
/// [`ClassFileLocator::close`].
#[derive(Debug)]
pub struct ForJarFile {
    path: PathBuf,
    archive: Mutex<Option<ZipArchive<Cursor<Mmap>>>>,
}

impl ForJarFile {
    pub fn of(jar_path: &Path) -> Result<Self> {
        let file = File::open(jar_path)
            .with_context(|| format!("Failed to open jar: {}", jar_path.display()))?;
        // SAFETY: The file is opened read-only and the mapping is owned by the
        // archive, which is dropped before the locator.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap jar: {}", jar_path.display()))?;
        let archive = ZipArchive::new(Cursor::new(mmap))
            .with_context(|| format!("Failed to read zip structure: {}", jar_path.display()))?;
        Ok(Self {
            path: jar_path.to_path_buf(),
            archive: Mutex::new(Some(archive)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ClassFileLocator for ForJarFile {
    fn resource(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let mut guard = self
            .archive
            .lock()
            .map_err(|_| anyhow!("Jar locator lock poisoned: {}", self.path.display()))?;
        let archive = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Jar locator is closed: {}", self.path.display()))?;
        let mut entry = match archive.by_name(path) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to read {path} from {}", self.path.display())
                });
            }
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {path} from {}", self.path.display()))?;
        Ok(Some(bytes))
    }

    fn close(&self) -> Result<()> {
        let mut guard = self
            .archive
            .lock()
            .map_err(|_| anyhow!("Jar locator lock poisoned: {}", self.path.display()))?;
        guard.take();
        Ok(())
    }
}

/// Regular files are archives, anything else is treated as a folder.
pub fn for_entry(entry: &Path) -> Result<Box<dyn ClassFileLocator>> {
    if entry.is_file() {
        Ok(Box::new(ForJarFile::of(entry)?))
    } else {
        Ok(Box::new(ForFolder::new(entry)))
    }
}

/// Opens the locator for a single class-path entry.
pub type LocatorFactory = Arc<dyn Fn(&Path) -> Result<Box<dyn ClassFileLocator>> + Send + Sync>;

pub fn entry_factory() -> LocatorFactory {
    Arc::new(for_entry)
}

#[derive(Default)]
pub struct Compound {
    locators: Vec<Box<dyn ClassFileLocator>>,
}

impl Compound {
    pub fn new(locators: Vec<Box<dyn ClassFileLocator>>) -> Self {
        Self { locators }
    }

    pub fn for_class_path<'a>(entries: impl IntoIterator<Item = &'a PathBuf>) -> Result<Self> {
        Self::for_class_path_with(entries, &entry_factory())
    }

    /// Opens every entry through `factory`. Entries opened before a failure
    /// are closed again.
    pub fn for_class_path_with<'a>(
        entries: impl IntoIterator<Item = &'a PathBuf>,
        factory: &LocatorFactory,
    ) -> Result<Self> {
        let mut compound = Self::default();
        for entry in entries {
            match factory(entry) {
                Ok(locator) => compound.locators.push(locator),
                Err(err) => {
                    if let Err(close) = compound.close() {
                        tracing::warn!("Failed to close class file locator: {close:#}");
                    }
                    return Err(err);
                }
            }
        }
        Ok(compound)
    }

    pub fn members(&self) -> impl Iterator<Item = &dyn ClassFileLocator> {
        self.locators.iter().map(|locator| locator.as_ref())
    }

    pub fn len(&self) -> usize {
        self.locators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }
}

impl ClassFileLocator for Compound {
    fn resource(&self, path: &str) -> Result<Option<Vec<u8>>> {
        for locator in &self.locators {
            if let Some(bytes) = locator.resource(path)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    /// Closes every member, reporting the first failure after all were tried.
    fn close(&self) -> Result<()> {
        let mut first_error = None;
        for locator in &self.locators {
            if let Err(err) = locator.close() {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};
    use zip::write::{FileOptions, ZipWriter};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path(name: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "class-transform-locator-{}-{}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_millis(),
            n,
            name
        ))
    }

    fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
        let file = fs::File::create(path)?;
        let mut zip = ZipWriter::new(file);
        for (name, content) in entries {
            zip.start_file(*name, FileOptions::default())?;
            zip.write_all(content)?;
        }
        zip.finish()?;
        Ok(())
    }

    #[test]
    fn compound_lookup_is_first_hit_in_class_path_order() -> Result<()> {
        let folder = temp_path("folder");
        fs::create_dir_all(folder.join("org/example"))?;
        fs::write(folder.join("org/example/Demo.class"), b"from-folder")?;

        let jar = temp_path("lib.jar");
        write_jar(
            &jar,
            &[
                ("org/example/Demo.class", b"from-jar"),
                ("org/example/Other.class", b"other"),
            ],
        )?;

        let entries = vec![folder.clone(), jar.clone()];
        let locator = Compound::for_class_path(&entries)?;
        assert_eq!(locator.len(), 2);
        assert_eq!(
            locator.locate("org.example.Demo")?.as_deref(),
            Some(&b"from-folder"[..])
        );
        assert_eq!(
            locator.locate("org/example/Other")?.as_deref(),
            Some(&b"other"[..])
        );
        assert!(locator.locate("org.example.Missing")?.is_none());
        locator.close()?;

        let _ = fs::remove_dir_all(folder);
        let _ = fs::remove_file(jar);
        Ok(())
    }

    #[test]
    fn closed_jar_locator_refuses_lookups() -> Result<()> {
        let jar = temp_path("closed.jar");
        write_jar(&jar, &[("A.class", b"a")])?;

        let locator = ForJarFile::of(&jar)?;
        assert!(locator.resource("A.class")?.is_some());
        locator.close()?;
        assert!(locator.resource("A.class").is_err());

        let _ = fs::remove_file(jar);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn jar_lookups_use_the_archive_read_at_open() -> Result<()> {
        let jar = temp_path("unlinked.jar");
        write_jar(&jar, &[("a/A.class", b"a"), ("a/B.class", b"b")])?;

        let locator = ForJarFile::of(&jar)?;
        fs::remove_file(&jar)?;
        for _ in 0..3 {
            assert_eq!(locator.resource("a/A.class")?, Some(b"a".to_vec()));
            assert_eq!(locator.resource("a/B.class")?, Some(b"b".to_vec()));
        }
        assert!(locator.resource("a/C.class")?.is_none());
        locator.close()?;
        Ok(())
    }

    struct Tracked(Arc<std::sync::atomic::AtomicUsize>);

    impl ClassFileLocator for Tracked {
        fn resource(&self, _: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn close(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn partially_opened_class_path_is_closed_on_failure() {
        let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let tracked = Arc::clone(&closed);
        let factory: LocatorFactory = Arc::new(move |entry: &Path| -> Result<Box<dyn ClassFileLocator>> {
            if entry.ends_with("broken.jar") {
                anyhow::bail!("Failed to read zip structure: {}", entry.display());
            }
            Ok(Box::new(Tracked(Arc::clone(&tracked))))
        });
        let entries = vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("broken.jar")];

        assert!(Compound::for_class_path_with(&entries, &factory).is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_folder_entry_resolves_nothing() -> Result<()> {
        let locator = ForFolder::new(temp_path("never-created"));
        assert!(locator.locate("a.B")?.is_none());
        Ok(())
    }
}
