//! The transformation engine.
//!
//! `Engine::apply` reads every element of a source view, runs the configured
//! plugins over each class file and writes the result into a target folder.
//! Elements that no plugin matches, resources, and types that fail are
//! copied through unchanged.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::change::is_class_file;
use crate::classfile::{ClassFile, ClassFileVersion, TypeDescription};
use crate::dispatcher::DispatcherFactory;
use crate::factory::PluginFactory;
use crate::locator::{ClassFileLocator, ForFolder};
use crate::plugin::{Plugin, TypeBuilder};
use crate::report::{ErrorHandler, Listener};
use crate::source::{Element, SourceView, TargetFolder};

/// Packages whose types are provided by the platform rather than the class
/// path.
const PLATFORM_PACKAGES: &[&str] = &["java.", "javax.", "jdk.", "sun."];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryPoint {
    #[default]
    Rebase,
    Redefine,
    Decorate,
}

impl EntryPoint {
    pub fn allows_structural_changes(self) -> bool {
        !matches!(self, Self::Decorate)
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "REBASE" => Ok(Self::Rebase),
            "REDEFINE" => Ok(Self::Redefine),
            "DECORATE" => Ok(Self::Decorate),
            other => Err(anyhow!("Unknown entry point: {other}")),
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rebase => "REBASE",
            Self::Redefine => "REDEFINE",
            Self::Decorate => "DECORATE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PoolStrategy {
    /// Describes type headers only.
    #[default]
    Fast,
    /// Also describes fields and methods.
    Extended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodNameTransformer {
    Suffixing(String),
}

impl MethodNameTransformer {
    pub fn suffixing(suffix: impl Into<String>) -> Self {
        Self::Suffixing(suffix.into())
    }

    pub fn with_random_suffix() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut hasher = Sha256::new();
        hasher.update(nanos.to_be_bytes());
        hasher.update(std::process::id().to_be_bytes());
        let digest = hex::encode(hasher.finalize());
        Self::Suffixing(format!("original${}", &digest[..8]))
    }

    /// `with_random_suffix` for an empty suffix, otherwise `suffixing`.
    pub fn for_suffix(suffix: &str) -> Self {
        if suffix.is_empty() {
            Self::with_random_suffix()
        } else {
            Self::suffixing(suffix)
        }
    }

    pub fn transform(&self, method: &str) -> String {
        match self {
            Self::Suffixing(suffix) => format!("{method}${suffix}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub transformed: Vec<String>,
    pub failed: BTreeMap<String, Vec<String>>,
    pub unresolved: Vec<String>,
}

pub struct Engine<'a> {
    entry_point: EntryPoint,
    class_file_version: ClassFileVersion,
    name_transformer: MethodNameTransformer,
    pool_strategy: PoolStrategy,
    locator: Option<&'a dyn ClassFileLocator>,
    listeners: Vec<Arc<dyn Listener>>,
    error_handlers: Vec<Arc<dyn ErrorHandler>>,
    dispatcher: DispatcherFactory,
}

impl<'a> Engine<'a> {
    pub fn of(
        entry_point: EntryPoint,
        class_file_version: ClassFileVersion,
        name_transformer: MethodNameTransformer,
    ) -> Self {
        Self {
            entry_point,
            class_file_version,
            name_transformer,
            pool_strategy: PoolStrategy::Fast,
            locator: None,
            listeners: Vec::new(),
            error_handlers: Vec::new(),
            dispatcher: DispatcherFactory::Serial,
        }
    }

    pub fn with_pool_strategy(mut self, pool_strategy: PoolStrategy) -> Self {
        self.pool_strategy = pool_strategy;
        self
    }

    pub fn with_locator(mut self, locator: &'a dyn ClassFileLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_error_handlers(mut self, handlers: Vec<Arc<dyn ErrorHandler>>) -> Self {
        self.error_handlers.extend(handlers);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherFactory) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn apply(
        &self,
        source: SourceView,
        target: &TargetFolder,
        factories: &[Box<dyn PluginFactory>],
    ) -> Result<Summary> {
        let mut plugins = Vec::with_capacity(factories.len());
        for factory in factories {
            let plugin = factory
                .make()
                .with_context(|| format!("Cannot instantiate plugin {}", factory.name()))?;
            plugins.push(plugin);
        }

        let source_locator = ForFolder::new(source.root());
        let locator = SourceFirst {
            source: &source_locator,
            class_path: self.locator,
        };
        let run = Run {
            engine: self,
            plugins: &plugins,
            locator: &locator,
            target,
            state: Mutex::new(RunState::default()),
        };

        let dispatched = self
            .dispatcher
            .dispatch(source.into_elements(), |element| run.process(element));

        for plugin in &plugins {
            if let Err(err) = plugin.close() {
                for listener in &self.listeners {
                    listener.on_close_error(plugin.name(), &err);
                }
            }
        }
        dispatched?;

        let state = run
            .state
            .into_inner()
            .map_err(|_| anyhow!("Engine state poisoned"))?;

        if !state.failed.is_empty() {
            for listener in &self.listeners {
                listener.on_errors(&state.failed);
            }
            for handler in &self.error_handlers {
                handler.on_errors(&state.failed)?;
            }
        }
        for name in &state.unresolved {
            for listener in &self.listeners {
                listener.on_unresolved(name);
            }
            for handler in &self.error_handlers {
                handler.on_unresolved(name)?;
            }
        }

        Ok(Summary {
            transformed: state.transformed,
            failed: state.failed,
            unresolved: state.unresolved.into_iter().collect(),
        })
    }
}

#[derive(Default)]
struct RunState {
    transformed: Vec<String>,
    failed: BTreeMap<String, Vec<String>>,
    unresolved: BTreeSet<String>,
}

struct Run<'r> {
    engine: &'r Engine<'r>,
    plugins: &'r [Box<dyn Plugin>],
    locator: &'r SourceFirst<'r>,
    target: &'r TargetFolder,
    state: Mutex<RunState>,
}

impl Run<'_> {
    fn process(&self, element: Element) -> Result<()> {
        let name = element.name();
        if !is_class_file(name) || is_descriptor(name) {
            self.target.retain(&element)?;
            for listener in &self.engine.listeners {
                listener.on_resource(name);
            }
            return Ok(());
        }

        let described = element.read().and_then(|bytes| {
            let class = ClassFile::parse(bytes)?;
            let description = class.describe(self.engine.pool_strategy == PoolStrategy::Extended)?;
            Ok((class, description))
        });
        let (class, description) = match described {
            Ok(described) => described,
            Err(err) => {
                let type_name = name.trim_end_matches(".class").replace('/', ".");
                tracing::debug!("Cannot describe {type_name}: {err:#}");
                self.with_state(|state| {
                    state.unresolved.insert(type_name);
                })?;
                return self.target.retain(&element);
            }
        };
        for listener in &self.engine.listeners {
            listener.on_discovery(&description.name);
        }

        let mut builder = TypeBuilder::new(
            class,
            self.engine.entry_point,
            self.engine.class_file_version,
            self.engine.name_transformer.clone(),
        );
        let mut applied: Vec<&str> = Vec::new();
        let mut errors: Vec<anyhow::Error> = Vec::new();
        for plugin in self.plugins {
            if !plugin.matches(&description) {
                continue;
            }
            match plugin.apply(&mut builder, &description, self.locator) {
                Ok(()) => applied.push(plugin.name()),
                Err(err) => {
                    for listener in &self.engine.listeners {
                        listener.on_error(&description, plugin.name(), &err);
                    }
                    for handler in &self.engine.error_handlers {
                        handler.on_error(&description, plugin.name(), &err)?;
                    }
                    errors.push(err);
                }
            }
        }

        if errors.is_empty() && !applied.is_empty() {
            match self.materialize(&builder, &description) {
                Ok(bytes) => {
                    let unresolved = self.unresolved_dependencies(&description)?;
                    self.target.store(name, &bytes)?;
                    self.with_state(|state| {
                        state.transformed.push(description.name.clone());
                        state.unresolved.extend(unresolved);
                    })?;
                    for listener in &self.engine.listeners {
                        listener.on_transformation(&description, &applied);
                    }
                }
                Err(err) => errors.push(err),
            }
        } else if errors.is_empty() {
            for listener in &self.engine.listeners {
                let names: Vec<&str> = self.plugins.iter().map(|p| p.name()).collect();
                listener.on_ignored(&description, &names);
            }
            self.target.retain(&element)?;
        }

        if !errors.is_empty() {
            for listener in &self.engine.listeners {
                listener.on_failure(&description, &errors);
            }
            for handler in &self.engine.error_handlers {
                handler.on_failure(&description, &errors)?;
            }
            let messages = errors.iter().map(|e| format!("{e:#}")).collect();
            self.with_state(|state| {
                state.failed.insert(description.name.clone(), messages);
            })?;
            self.target.retain(&element)?;
        }

        for listener in &self.engine.listeners {
            listener.on_complete(&description);
        }
        Ok(())
    }

    /// Emits the builder's bytes, giving listeners and error handlers a say
    /// on live initializers first.
    fn materialize(&self, builder: &TypeBuilder, description: &TypeDescription) -> Result<Vec<u8>> {
        let bytes = builder.make()?;
        if builder.has_live_initializer() {
            for listener in &self.engine.listeners {
                listener.on_live_initializer(description, description);
            }
            for handler in &self.engine.error_handlers {
                handler.on_live_initializer(description, description)?;
            }
        }
        Ok(bytes)
    }

    fn unresolved_dependencies(&self, description: &TypeDescription) -> Result<Vec<String>> {
        let mut unresolved = Vec::new();
        let dependencies = description
            .super_name
            .iter()
            .chain(description.interfaces.iter());
        for dependency in dependencies {
            if PLATFORM_PACKAGES.iter().any(|p| dependency.starts_with(p)) {
                continue;
            }
            if self.locator.locate(dependency)?.is_none() {
                unresolved.push(dependency.clone());
            }
        }
        Ok(unresolved)
    }

    fn with_state(&self, f: impl FnOnce(&mut RunState)) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("Engine state poisoned"))?;
        f(&mut state);
        Ok(())
    }
}

fn is_descriptor(name: &str) -> bool {
    let file = name.rsplit('/').next().unwrap_or(name);
    file == "module-info.class" || file == "package-info.class"
}

/// Resolves against the source tree before the class path.
struct SourceFirst<'a> {
    source: &'a ForFolder,
    class_path: Option<&'a dyn ClassFileLocator>,
}

impl ClassFileLocator for SourceFirst<'_> {
    fn resource(&self, path: &str) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.source.resource(path)? {
            return Ok(Some(bytes));
        }
        match self.class_path {
            Some(locator) => locator.resource(path),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::tests::class_bytes;
    use crate::classfile::ACC_PUBLIC;
    use crate::report::{Enforcing, Failing};
    use std::path::{Path, PathBuf};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "class_transform_engine_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_file(path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    struct Marker {
        only: &'static str,
        fail_on: Option<&'static str>,
        live: bool,
    }

    impl Plugin for Marker {
        fn name(&self) -> &str {
            "Marker"
        }

        fn matches(&self, target: &TypeDescription) -> bool {
            self.only.is_empty() || target.simple_name() == self.only
        }

        fn apply(&self, builder: &mut TypeBuilder, target: &TypeDescription, _: &dyn ClassFileLocator) -> Result<()> {
            if Some(target.simple_name()) == self.fail_on {
                anyhow::bail!("refusing {}", target.name);
            }
            builder.define_field("marked", "Z", ACC_PUBLIC)?;
            if self.live {
                builder.require_live_initializer();
            }
            Ok(())
        }
    }

    struct MarkerFactory(fn() -> Marker);

    impl PluginFactory for MarkerFactory {
        fn name(&self) -> &str {
            "Marker"
        }

        fn make(&self) -> Result<Box<dyn Plugin>> {
            Ok(Box::new((self.0)()))
        }
    }

    fn engine<'a>() -> Engine<'a> {
        Engine::of(
            EntryPoint::Rebase,
            ClassFileVersion::JAVA_V8,
            MethodNameTransformer::suffixing("original$test"),
        )
    }

    fn marked(path: &Path) -> Result<bool> {
        let class = ClassFile::parse(std::fs::read(path)?)?;
        Ok(class.field_names()?.iter().any(|f| f == "marked"))
    }

    #[test]
    fn transforms_matches_and_copies_everything_else() -> Result<()> {
        let base = temp_dir("basic");
        let source = base.join("raw");
        let target = base.join("out");
        write_file(&source.join("a/Foo.class"), &class_bytes("a/Foo", Some("java/lang/Object"), &[]))?;
        write_file(&source.join("a/Bar.class"), &class_bytes("a/Bar", Some("java/lang/Object"), &[]))?;
        write_file(&source.join("a/package-info.class"), b"not really a class")?;
        write_file(&source.join("app.properties"), b"k=v")?;

        let factories: Vec<Box<dyn PluginFactory>> = vec![Box::new(MarkerFactory(|| Marker {
            only: "Foo",
            fail_on: None,
            live: false,
        }))];
        let summary = engine().apply(SourceView::folder(&source), &TargetFolder::new(&target), &factories)?;

        assert_eq!(summary.transformed, vec!["a.Foo".to_string()]);
        assert!(summary.failed.is_empty());
        assert!(summary.unresolved.is_empty());
        assert!(marked(&target.join("a/Foo.class"))?);
        assert!(!marked(&target.join("a/Bar.class"))?);
        assert_eq!(std::fs::read(target.join("app.properties"))?, b"k=v");
        assert_eq!(std::fs::read(target.join("a/package-info.class"))?, b"not really a class");

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn failed_types_are_aggregated_and_retained() -> Result<()> {
        let base = temp_dir("aggregate");
        let source = base.join("raw");
        let target = base.join("out");
        for name in ["A", "B", "C"] {
            write_file(
                &source.join(format!("p/{name}.class")),
                &class_bytes(&format!("p/{name}"), Some("java/lang/Object"), &[]),
            )?;
        }

        let factories: Vec<Box<dyn PluginFactory>> = vec![Box::new(MarkerFactory(|| Marker {
            only: "",
            fail_on: Some("B"),
            live: false,
        }))];
        let summary = engine()
            .with_dispatcher(DispatcherFactory::Parallel(2))
            .apply(SourceView::folder(&source), &TargetFolder::new(&target), &factories)?;

        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed.contains_key("p.B"));
        assert_eq!(summary.transformed.len(), 2);
        assert!(!marked(&target.join("p/B.class"))?);
        assert!(marked(&target.join("p/A.class"))?);

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn fail_fast_aborts_the_run() -> Result<()> {
        let base = temp_dir("fail_fast");
        let source = base.join("raw");
        write_file(&source.join("p/B.class"), &class_bytes("p/B", Some("java/lang/Object"), &[]))?;

        let factories: Vec<Box<dyn PluginFactory>> = vec![Box::new(MarkerFactory(|| Marker {
            only: "",
            fail_on: Some("B"),
            live: false,
        }))];
        let result = engine()
            .with_error_handlers(vec![Arc::new(Failing::FailFast)])
            .apply(SourceView::folder(&source), &TargetFolder::new(base.join("out")), &factories);
        assert!(result.is_err());

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn live_initializers_fail_types_only_when_enforced() -> Result<()> {
        let base = temp_dir("live");
        let source = base.join("raw");
        write_file(&source.join("p/L.class"), &class_bytes("p/L", Some("java/lang/Object"), &[]))?;
        let factories: Vec<Box<dyn PluginFactory>> = vec![Box::new(MarkerFactory(|| Marker {
            only: "",
            fail_on: None,
            live: true,
        }))];

        let relaxed = engine().apply(
            SourceView::folder(&source),
            &TargetFolder::new(base.join("relaxed")),
            &factories,
        )?;
        assert_eq!(relaxed.transformed, vec!["p.L".to_string()]);

        let enforced = engine()
            .with_error_handlers(vec![Arc::new(Enforcing::NoLiveInitializers)])
            .apply(
                SourceView::folder(&source),
                &TargetFolder::new(base.join("enforced")),
                &factories,
            )?;
        assert!(enforced.transformed.is_empty());
        assert!(enforced.failed.contains_key("p.L"));

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn unresolved_super_types_fail_when_all_types_must_resolve() -> Result<()> {
        let base = temp_dir("unresolved");
        let source = base.join("raw");
        write_file(&source.join("p/Child.class"), &class_bytes("p/Child", Some("lib/Missing"), &[]))?;
        let factories: Vec<Box<dyn PluginFactory>> = vec![Box::new(MarkerFactory(|| Marker {
            only: "",
            fail_on: None,
            live: false,
        }))];

        let lenient = engine().apply(
            SourceView::folder(&source),
            &TargetFolder::new(base.join("lenient")),
            &factories,
        )?;
        assert_eq!(lenient.unresolved, vec!["lib.Missing".to_string()]);

        let strict = engine()
            .with_error_handlers(vec![Arc::new(Enforcing::AllTypesResolved)])
            .apply(
                SourceView::folder(&source),
                &TargetFolder::new(base.join("strict")),
                &factories,
            );
        assert!(strict.is_err());

        let lib = base.join("lib");
        write_file(&lib.join("lib/Missing.class"), &class_bytes("lib/Missing", Some("java/lang/Object"), &[]))?;
        let class_path = ForFolder::new(&lib);
        let resolved = engine()
            .with_locator(&class_path)
            .with_error_handlers(vec![Arc::new(Enforcing::AllTypesResolved)])
            .apply(
                SourceView::folder(&source),
                &TargetFolder::new(base.join("resolved")),
                &factories,
            )?;
        assert!(resolved.unresolved.is_empty());

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn random_suffix_is_prefixed_with_original() {
        let MethodNameTransformer::Suffixing(suffix) = MethodNameTransformer::for_suffix("");
        assert!(suffix.starts_with("original$"));
        assert_eq!(suffix.len(), "original$".len() + 8);
        assert_eq!(
            MethodNameTransformer::for_suffix("x").transform("run"),
            "run$x"
        );
    }

    #[test]
    fn entry_points_parse_case_insensitively() -> Result<()> {
        assert_eq!(EntryPoint::parse("rebase")?, EntryPoint::Rebase);
        assert_eq!(EntryPoint::parse("DECORATE")?, EntryPoint::Decorate);
        assert!(EntryPoint::parse("REDEFINE_LOCAL").is_err());
        Ok(())
    }
}
