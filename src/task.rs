//! The transformation task: turns a change stream into one engine run.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::change::InputChanges;
use crate::classfile::ClassFileVersion;
use crate::classpath::LoaderResolver;
use crate::config::{PluginArgument, TaskConfig, argument_resolvers, host_class_file_version};
use crate::dispatcher::DispatcherFactory;
use crate::engine::{Engine, MethodNameTransformer, PoolStrategy, Summary};
use crate::error::TaskError;
use crate::factory::{ArgumentResolver, PluginFactory, ReflectiveFactory};
use crate::incremental::same_directory;
use crate::locator::{self, ClassFileLocator, Compound, LocatorFactory};
use crate::plugin::{Argument, PluginRegistry, PluginType};
use crate::registration::transformer_task_name;
use crate::report::{Enforcing, ErrorHandler, Failing, TaskBuildLogger, TaskLogger, TransformationLogger};
use crate::source::SourceView;

#[derive(Debug, Clone)]
pub enum PluginReference {
    /// Looked up through the plugin loader for the task's class path.
    Named(String),
    Handle(Arc<PluginType>),
}

impl PluginReference {
    fn name(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Handle(plugin) => plugin.name(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transformation {
    pub plugin: PluginReference,
    pub arguments: Vec<PluginArgument>,
    pub class_path: Vec<PathBuf>,
}

pub struct TransformationTask {
    config: TaskConfig,
    registry: Arc<PluginRegistry>,
    transformations: Vec<Transformation>,
    logger: TaskLogger,
    locator_factory: LocatorFactory,
}

impl TransformationTask {
    pub fn new(config: TaskConfig, registry: Arc<PluginRegistry>) -> Self {
        let transformations = config
            .transformations
            .iter()
            .map(|spec| Transformation {
                plugin: PluginReference::Named(spec.plugin.clone()),
                arguments: spec.arguments.clone(),
                class_path: spec.class_path.clone(),
            })
            .collect();
        Self {
            config,
            registry,
            transformations,
            logger: TaskLogger::new(transformer_task_name(crate::registration::MAIN_SOURCE_SET)),
            locator_factory: locator::entry_factory(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.logger = TaskLogger::new(name);
        self
    }

    /// Appends a transformation that uses a plugin type directly instead of
    /// looking it up by name.
    pub fn with_plugin(mut self, plugin: Arc<PluginType>, arguments: Vec<PluginArgument>) -> Self {
        self.transformations.push(Transformation {
            plugin: PluginReference::Handle(plugin),
            arguments,
            class_path: Vec::new(),
        });
        self
    }

    /// Opens class-path entries for both plugin loading and type lookup.
    pub fn with_locator_factory(mut self, factory: LocatorFactory) -> Self {
        self.locator_factory = factory;
        self
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn run(&self, changes: &InputChanges) -> Result<Summary, TaskError> {
        self.config.validate()?;
        let (source_root, target_root) = match (&self.config.source, &self.config.target) {
            (Some(source), Some(target)) => (source.as_path(), target.as_path()),
            _ => return Err(TaskError::invalid("Source and target folder must be set")),
        };
        if same_directory(source_root, target_root) {
            return Err(TaskError::invalid(format!(
                "Source and target folder cannot be equal: {}",
                source_root.display()
            )));
        }

        let source = if self.config.incremental && changes.incremental {
            self.logger.debug("Applying incremental build");
            let resolver = self.config.incremental_resolver.resolver();
            let resolution = resolver
                .resolve(&changes.changes, source_root, target_root)
                .map_err(TaskError::Incremental)?;
            self.logger.debug(&format!(
                "Resolved {} files to process with {} and purged {}",
                resolution.files.len(),
                resolver.name(),
                resolution.purged.len()
            ));
            SourceView::explicit(source_root, resolution.files)
        } else {
            self.logger.debug("Applying non-incremental build");
            clear_directory(target_root).map_err(|source| TaskError::Transformation {
                root: source_root.to_path_buf(),
                source,
            })?;
            SourceView::folder(source_root)
        };

        let summary = if source.is_known_empty() {
            self.logger
                .info("No class files to process, skipping transformation");
            Summary::default()
        } else {
            let mut resolver = LoaderResolver::new(Arc::clone(&self.registry))
                .with_locator_factory(Arc::clone(&self.locator_factory));
            let result = self.transform(&mut resolver, source, source_root, target_root);
            if let Err(err) = resolver.close() {
                self.logger
                    .warn(&format!("Failed to close plugin loaders: {err:#}"));
            }
            result?
        };

        if !summary.failed.is_empty() {
            return Err(TaskError::TransformationFailed {
                count: summary.failed.len(),
                failed: summary.failed,
            });
        } else if self.config.warn_on_empty_type_set && summary.transformed.is_empty() {
            self.logger
                .warn("No types were transformed during plugin execution");
        } else {
            self.logger
                .info(&format!("Transformed {} types", summary.transformed.len()));
        }
        Ok(summary)
    }

    fn transform(
        &self,
        resolver: &mut LoaderResolver,
        source: SourceView,
        source_root: &Path,
        target_root: &Path,
    ) -> Result<Summary, TaskError> {
        let factories = self.factories(resolver, source_root)?;

        let entry_point = self.config.entry_point();
        self.logger
            .info(&format!("Resolved entry point: {entry_point}"));
        let class_file_version = self.class_file_version()?;
        let name_transformer = MethodNameTransformer::for_suffix(&self.config.suffix);

        let locator = Compound::for_class_path_with(&self.config.class_path_entries(), &self.locator_factory)
            .map_err(TaskError::EngineConstruction)?;
        let result = {
            self.logger.info(&format!(
                "Processing class files located in: {}",
                source_root.display()
            ));
            let engine = Engine::of(entry_point, class_file_version, name_transformer)
                .with_pool_strategy(if self.config.extended_parsing {
                    PoolStrategy::Extended
                } else {
                    PoolStrategy::Fast
                })
                .with_locator(&locator)
                .with_listener(Arc::new(TransformationLogger::new(self.logger.clone())))
                .with_error_handlers(self.error_handlers())
                .with_dispatcher(DispatcherFactory::for_threads(self.config.threads));
            engine
                .apply(source, &crate::source::TargetFolder::new(target_root), &factories)
                .map_err(|source| TaskError::Transformation {
                    root: source_root.to_path_buf(),
                    source,
                })
        };
        if let Err(err) = locator.close() {
            self.logger
                .warn(&format!("Failed to close class file locator: {err:#}"));
        }
        result
    }

    fn factories(
        &self,
        resolver: &mut LoaderResolver,
        source_root: &Path,
    ) -> Result<Vec<Box<dyn PluginFactory>>, TaskError> {
        let mut factories: Vec<Box<dyn PluginFactory>> = Vec::with_capacity(self.transformations.len());
        for transformation in &self.transformations {
            let name = transformation.plugin.name();
            let plugin = match &transformation.plugin {
                PluginReference::Handle(plugin) => Arc::clone(plugin),
                PluginReference::Named(name) => {
                    let class_path = self
                        .config
                        .class_path_entries()
                        .into_iter()
                        .chain(std::iter::once(source_root.to_path_buf()))
                        .chain(transformation.class_path.iter().cloned())
                        .collect::<Vec<_>>();
                    resolver
                        .resolve(class_path.iter().map(PathBuf::as_path))
                        .and_then(|loader| loader.load(name))
                        .map_err(|source| TaskError::PluginResolution {
                            plugin: name.clone(),
                            source,
                        })?
                }
            };
            let factory = ReflectiveFactory::of(plugin)
                .with(argument_resolvers(&transformation.arguments))
                .with([
                    ArgumentResolver::for_type(Argument::SourceRoot(source_root.to_path_buf())),
                    ArgumentResolver::for_type(Argument::Logger(self.logger.clone())),
                    ArgumentResolver::for_type(Argument::BuildLogger(Arc::new(TaskBuildLogger::new(
                        self.logger.clone(),
                    )))),
                ]);
            self.logger.info(&format!("Resolved plugin: {name}"));
            factories.push(Box::new(factory));
        }
        Ok(factories)
    }

    fn class_file_version(&self) -> Result<ClassFileVersion, TaskError> {
        match &self.config.target_compatibility {
            Some(compatibility) => {
                let version = compatibility
                    .class_file_version()
                    .map_err(TaskError::EntryPointResolution)?;
                self.logger
                    .debug(&format!("Java version detected: {}", version.java_version()));
                Ok(version)
            }
            None => {
                let version = host_class_file_version().map_err(TaskError::EngineConstruction)?;
                self.logger.warn(&format!(
                    "Could not locate Java target version, build is JDK dependant: {}",
                    version.java_version()
                ));
                Ok(version)
            }
        }
    }

    fn error_handlers(&self) -> Vec<Arc<dyn ErrorHandler>> {
        let mut handlers: Vec<Arc<dyn ErrorHandler>> = vec![Arc::new(Enforcing::AllTypesResolved)];
        if self.config.fail_on_live_initializer {
            handlers.push(Arc::new(Enforcing::NoLiveInitializers));
        }
        if self.config.fail_fast {
            handlers.push(Arc::new(Failing::FailFast));
        }
        handlers
    }
}

/// Removes everything below `root`, creating it if missing.
fn clear_directory(root: &Path) -> anyhow::Result<()> {
    if !root.exists() {
        return std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create target folder: {}", root.display()));
    }
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("Failed to list target folder: {}", root.display()))?
    {
        let path = entry?.path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.with_context(|| format!("Failed to delete {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeKind, ChangeRecord};
    use crate::classfile::tests::class_bytes;
    use crate::classfile::{ClassFile, TypeDescription};
    use crate::config::{Compatibility, TransformationSpec};
    use crate::engine::EntryPoint;
    use crate::plugin::{Arguments, Plugin, TypeBuilder};
    use anyhow::Result;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "class_transform_task_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_class(root: &Path, name: &str) -> Result<()> {
        let path = root.join(format!("{name}.class"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, class_bytes(name, Some("java/lang/Object"), &[]))?;
        Ok(())
    }

    fn fields(path: &Path) -> Result<Vec<String>> {
        ClassFile::parse(std::fs::read(path)?)?.field_names()
    }

    fn config(base: &Path) -> TaskConfig {
        TaskConfig {
            source: Some(base.join("mainRaw")),
            target: Some(base.join("main")),
            target_compatibility: Some(Compatibility::Release(8)),
            ..TaskConfig::default()
        }
    }

    struct Refusing;

    impl Plugin for Refusing {
        fn name(&self) -> &str {
            "Refusing"
        }

        fn matches(&self, _: &TypeDescription) -> bool {
            true
        }

        fn apply(&self, _: &mut TypeBuilder, target: &TypeDescription, _: &dyn ClassFileLocator) -> Result<()> {
            if target.simple_name() == "C42" {
                anyhow::bail!("cannot handle {}", target.name);
            }
            Ok(())
        }
    }

    fn refusing(_: &Arguments) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(Refusing))
    }

    #[test]
    fn one_failing_type_fails_the_run_after_all_others_are_written() -> Result<()> {
        let base = temp_dir("parallel");
        let mut config = config(&base);
        for i in 0..100 {
            write_class(config.source.as_deref().unwrap_or(&base), &format!("p/C{i}"))?;
        }
        config.threads = 4;
        config.transformations.push(TransformationSpec::new("DefineField"));

        let mut registry = PluginRegistry::builtin();
        let refusing = registry.register(PluginType::new("Refusing").constructor(vec![], refusing));
        let task = TransformationTask::new(config, Arc::new(registry)).with_plugin(refusing, Vec::new());

        match task.run(&InputChanges::full()) {
            Err(TaskError::TransformationFailed { count, failed }) => {
                assert_eq!(count, 1);
                assert!(failed.contains_key("p.C42"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let target = base.join("main/p");
        let mut transformed = 0;
        for i in 0..100 {
            let names = fields(&target.join(format!("C{i}.class")))?;
            if i == 42 {
                assert!(names.is_empty());
            } else {
                assert_eq!(names, vec!["proofOfWork".to_string()]);
                transformed += 1;
            }
        }
        assert_eq!(transformed, 99);

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn equal_source_and_target_is_rejected_without_writes() -> Result<()> {
        let base = temp_dir("equal");
        let mut config = config(&base);
        config.target = config.source.clone();
        let task = TransformationTask::new(config, Arc::new(PluginRegistry::builtin()));
        assert!(matches!(
            task.run(&InputChanges::full()),
            Err(TaskError::InvalidConfiguration(_))
        ));
        assert!(!base.exists());
        Ok(())
    }

    #[test]
    fn unknown_plugin_is_reported_by_name() -> Result<()> {
        let base = temp_dir("unknown");
        let mut config = config(&base);
        write_class(&base.join("mainRaw"), "a/Foo")?;
        config.transformations.push(TransformationSpec::new("NoSuchPlugin"));
        let task = TransformationTask::new(config, Arc::new(PluginRegistry::builtin()));
        match task.run(&InputChanges::full()) {
            Err(TaskError::PluginResolution { plugin, .. }) => assert_eq!(plugin, "NoSuchPlugin"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn decorate_cannot_define_fields() -> Result<()> {
        let base = temp_dir("decorate");
        let mut config = config(&base);
        write_class(&base.join("mainRaw"), "a/Foo")?;
        config.entry_point = Some(EntryPoint::Decorate);
        config.transformations.push(TransformationSpec::new("DefineField"));
        let task = TransformationTask::new(config, Arc::new(PluginRegistry::builtin()));
        assert!(matches!(
            task.run(&InputChanges::full()),
            Err(TaskError::TransformationFailed { count: 1, .. })
        ));
        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn live_initializers_fail_only_when_configured() -> Result<()> {
        let base = temp_dir("live");
        let mut config = config(&base);
        write_class(&base.join("mainRaw"), "a/Foo")?;
        config
            .transformations
            .push(TransformationSpec::new("InitializationHook"));

        let relaxed = TransformationTask::new(config.clone(), Arc::new(PluginRegistry::builtin()));
        assert_eq!(relaxed.run(&InputChanges::full())?.transformed, vec!["a.Foo".to_string()]);

        config.fail_on_live_initializer = true;
        let strict = TransformationTask::new(config, Arc::new(PluginRegistry::builtin()));
        assert!(matches!(
            strict.run(&InputChanges::full()),
            Err(TaskError::TransformationFailed { count: 1, .. })
        ));
        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn full_runs_clear_the_target_and_incremental_runs_rewrite_groups() -> Result<()> {
        let base = temp_dir("incremental");
        let config = config(&base);
        let source = base.join("mainRaw");
        let target = base.join("main");
        write_class(&source, "a/Foo")?;
        write_class(&source, "a/Foo$1")?;
        write_class(&source, "a/Bar")?;
        std::fs::create_dir_all(&target)?;
        std::fs::write(target.join("stale.txt"), b"old")?;

        let mut config = config;
        config.transformations.push(TransformationSpec::new("DefineField"));
        let task = TransformationTask::new(config, Arc::new(PluginRegistry::builtin()));
        let full = task.run(&InputChanges::full())?;
        assert_eq!(full.transformed.len(), 3);
        assert!(!target.join("stale.txt").exists());
        let full_bytes = std::fs::read(target.join("a/Foo$1.class"))?;

        let incremental = task.run(&InputChanges::incremental(vec![ChangeRecord::new(
            source.join("a/Foo.class"),
            ChangeKind::Modified,
        )]))?;
        let mut rewritten = incremental.transformed.clone();
        rewritten.sort();
        assert_eq!(rewritten, vec!["a.Foo".to_string(), "a.Foo$1".to_string()]);
        assert_eq!(std::fs::read(target.join("a/Foo$1.class"))?, full_bytes);
        assert!(target.join("a/Bar.class").exists());

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[derive(Default)]
    struct Counts {
        opened: std::sync::atomic::AtomicUsize,
        closed: std::sync::atomic::AtomicUsize,
        reclosed: std::sync::atomic::AtomicUsize,
    }

    impl Counts {
        fn get(&self) -> (usize, usize, usize) {
            use std::sync::atomic::Ordering::SeqCst;
            (self.opened.load(SeqCst), self.closed.load(SeqCst), self.reclosed.load(SeqCst))
        }
    }

    struct Counting {
        inner: Box<dyn ClassFileLocator>,
        counts: Arc<Counts>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl ClassFileLocator for Counting {
        fn resource(&self, path: &str) -> Result<Option<Vec<u8>>> {
            self.inner.resource(path)
        }

        fn close(&self) -> Result<()> {
            use std::sync::atomic::Ordering::SeqCst;
            if self.closed.swap(true, SeqCst) {
                self.counts.reclosed.fetch_add(1, SeqCst);
            } else {
                self.counts.closed.fetch_add(1, SeqCst);
            }
            self.inner.close()
        }
    }

    fn counting_factory(counts: &Arc<Counts>) -> LocatorFactory {
        let counts = Arc::clone(counts);
        Arc::new(move |entry: &Path| -> Result<Box<dyn ClassFileLocator>> {
            counts.opened.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Box::new(Counting {
                inner: locator::for_entry(entry)?,
                counts: Arc::clone(&counts),
                closed: std::sync::atomic::AtomicBool::new(false),
            }))
        })
    }

    fn run_counted(config: TaskConfig, registry: PluginRegistry) -> (Result<Summary, TaskError>, (usize, usize, usize)) {
        let counts = Arc::new(Counts::default());
        let task = TransformationTask::new(config, Arc::new(registry)).with_locator_factory(counting_factory(&counts));
        let result = task.run(&InputChanges::full());
        (result, counts.get())
    }

    #[test]
    fn class_path_locators_are_closed_once_on_every_exit() -> Result<()> {
        let base = temp_dir("closing");
        let library = base.join("lib");
        std::fs::create_dir_all(&library)?;
        write_class(&base.join("mainRaw"), "a/Foo")?;
        let mut config = config(&base);
        config.class_path = vec![library.clone()];
        config.transformations.push(TransformationSpec::new("DefineField"));

        let (result, (opened, closed, reclosed)) = run_counted(config.clone(), PluginRegistry::builtin());
        assert_eq!(result?.transformed, vec!["a.Foo".to_string()]);
        // Loader over library and source root, engine over library.
        assert_eq!((opened, closed, reclosed), (3, 3, 0));

        let mut unknown = config.clone();
        unknown.transformations = vec![TransformationSpec::new("NoSuchPlugin")];
        let (result, (opened, closed, reclosed)) = run_counted(unknown, PluginRegistry::builtin());
        assert!(matches!(result, Err(TaskError::PluginResolution { .. })));
        assert_eq!((opened, closed, reclosed), (2, 2, 0));

        let mut unsupported = config.clone();
        unsupported.target_compatibility = Some(Compatibility::Release(65500));
        let (result, (opened, closed, reclosed)) = run_counted(unsupported, PluginRegistry::builtin());
        assert!(matches!(result, Err(TaskError::EntryPointResolution(_))));
        assert_eq!((opened, closed, reclosed), (2, 2, 0));

        write_class(&base.join("mainRaw"), "a/C42")?;
        let mut failing = config;
        failing.fail_fast = true;
        failing.transformations = vec![TransformationSpec::new("Refusing")];
        let mut registry = PluginRegistry::builtin();
        registry.register(PluginType::new("Refusing").constructor(vec![], refusing));
        let (result, (opened, closed, reclosed)) = run_counted(failing, registry);
        assert!(matches!(result, Err(TaskError::Transformation { .. })));
        assert_eq!((opened, closed, reclosed), (3, 3, 0));

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }

    #[test]
    fn incremental_runs_purge_removed_package_folders() -> Result<()> {
        let base = temp_dir("removed_package");
        let source = base.join("mainRaw");
        let target = base.join("main");
        write_class(&source, "a/Foo")?;
        let mut config = config(&base);
        config.transformations.push(TransformationSpec::new("DefineField"));
        let task = TransformationTask::new(config, Arc::new(PluginRegistry::builtin()));
        task.run(&InputChanges::full())?;

        write_class(&source, "gone/Bar")?;
        task.run(&InputChanges::full())?;
        assert!(target.join("gone/Bar.class").exists());
        std::fs::remove_dir_all(source.join("gone"))?;

        let summary = task.run(&InputChanges::incremental(vec![
            ChangeRecord::new(source.join("gone/Bar.class"), ChangeKind::Removed),
            ChangeRecord::new(source.join("gone"), ChangeKind::Removed),
        ]))?;
        assert!(summary.transformed.is_empty());
        assert!(!target.join("gone").exists());
        assert!(target.join("a/Foo.class").exists());

        let _ = std::fs::remove_dir_all(base);
        Ok(())
    }
}
