//! Plugin loaders keyed by class-path identity.
//!
//! A loader sees every system plugin plus the extension plugins declared by
//! a `META-INF/class-transform/plugins` descriptor somewhere on its class
//! path. Loaders for the same set of canonical paths are shared.

use anyhow::{Context, Result, anyhow, bail};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::locator::{self, ClassFileLocator, Compound, LocatorFactory};
use crate::plugin::{PluginRegistry, PluginType};

pub const PLUGIN_DESCRIPTOR: &str = "META-INF/class-transform/plugins";

pub type ClassPathIdentity = BTreeSet<PathBuf>;

/// Absolute, deduplicated and order-insensitive. Entries that do not exist
/// are kept in absolute form.
pub fn class_path_identity<'a>(entries: impl IntoIterator<Item = &'a Path>) -> Result<ClassPathIdentity> {
    entries
        .into_iter()
        .map(|entry| {
            std::fs::canonicalize(entry)
                .or_else(|_| std::path::absolute(entry))
                .with_context(|| format!("Cannot resolve class path entry: {}", entry.display()))
        })
        .collect()
}

pub struct PluginLoader {
    class_path: ClassPathIdentity,
    registry: Arc<PluginRegistry>,
    locator: Compound,
    declared: BTreeSet<String>,
    closed: AtomicBool,
}

impl PluginLoader {
    fn open(registry: Arc<PluginRegistry>, class_path: ClassPathIdentity, factory: &LocatorFactory) -> Result<Self> {
        let locator = Compound::for_class_path_with(&class_path, factory)?;
        let declared = match read_declared(&locator) {
            Ok(declared) => declared,
            Err(err) => {
                if let Err(close) = locator.close() {
                    tracing::warn!("Failed to close plugin class path: {close:#}");
                }
                return Err(err);
            }
        };
        if !declared.is_empty() {
            tracing::debug!("Class path declares plugins: {declared:?}");
        }
        Ok(Self {
            class_path,
            registry,
            locator,
            declared,
            closed: AtomicBool::new(false),
        })
    }

    pub fn class_path(&self) -> &ClassPathIdentity {
        &self.class_path
    }

    pub fn declared(&self) -> &BTreeSet<String> {
        &self.declared
    }

    /// Looks up a plugin type without instantiating it. System types take
    /// precedence over extensions of the same name.
    pub fn load(&self, name: &str) -> Result<Arc<PluginType>> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("Plugin loader is closed; cannot load {name}");
        }
        if let Some(plugin) = self.registry.system(name) {
            return Ok(plugin);
        }
        if self.declared.contains(name)
            && let Some(plugin) = self.registry.extension(name)
        {
            return Ok(plugin);
        }
        Err(anyhow!(
            "Cannot find plugin {name} on class path {:?}",
            self.class_path
        ))
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.locator.close()
    }
}

/// Collects descriptor lines from every entry, not only the first hit.
fn read_declared(locator: &Compound) -> Result<BTreeSet<String>> {
    let mut declared = BTreeSet::new();
    for entry in locator.members() {
        if let Some(bytes) = entry.resource(PLUGIN_DESCRIPTOR)? {
            declared.extend(parse_descriptor(&String::from_utf8_lossy(&bytes)));
        }
    }
    Ok(declared)
}

fn parse_descriptor(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
}

/// Owns every loader created during one task run.
pub struct LoaderResolver {
    registry: Arc<PluginRegistry>,
    locator_factory: LocatorFactory,
    loaders: HashMap<ClassPathIdentity, Arc<PluginLoader>>,
}

impl LoaderResolver {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            locator_factory: locator::entry_factory(),
            loaders: HashMap::new(),
        }
    }

    pub fn with_locator_factory(mut self, factory: LocatorFactory) -> Self {
        self.locator_factory = factory;
        self
    }

    pub fn resolve<'a>(&mut self, class_path: impl IntoIterator<Item = &'a Path>) -> Result<Arc<PluginLoader>> {
        let identity = class_path_identity(class_path)?;
        if let Some(loader) = self.loaders.get(&identity) {
            return Ok(Arc::clone(loader));
        }
        let loader = Arc::new(PluginLoader::open(
            Arc::clone(&self.registry),
            identity.clone(),
            &self.locator_factory,
        )?);
        self.loaders.insert(identity, Arc::clone(&loader));
        Ok(loader)
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// Closes every loader, returning the first failure after all were
    /// tried.
    pub fn close(self) -> Result<()> {
        let mut first_error = None;
        for loader in self.loaders.values() {
            if let Err(err) = loader.close() {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
