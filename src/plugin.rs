//! The plugin contract, typed plugin handles and the registry that stands in
//! for reflective class loading.

use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::classfile::{ClassFile, ClassFileVersion, FieldDefinition, TypeDescription};
use crate::engine::{EntryPoint, MethodNameTransformer};
use crate::locator::ClassFileLocator;
use crate::report::{BuildLogger, TaskLogger};

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, target: &TypeDescription) -> bool;

    fn apply(
        &self,
        builder: &mut TypeBuilder,
        type_description: &TypeDescription,
        locator: &dyn ClassFileLocator,
    ) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Accumulates the changes plugins make to one type.
#[derive(Debug)]
pub struct TypeBuilder {
    class: ClassFile,
    entry_point: EntryPoint,
    class_file_version: ClassFileVersion,
    name_transformer: MethodNameTransformer,
    fields: Vec<FieldDefinition>,
    live_initializer: bool,
}

impl TypeBuilder {
    pub fn new(
        class: ClassFile,
        entry_point: EntryPoint,
        class_file_version: ClassFileVersion,
        name_transformer: MethodNameTransformer,
    ) -> Self {
        Self {
            class,
            entry_point,
            class_file_version,
            name_transformer,
            fields: Vec::new(),
            live_initializer: false,
        }
    }

    pub fn entry_point(&self) -> EntryPoint {
        self.entry_point
    }

    pub fn class_file_version(&self) -> ClassFileVersion {
        self.class_file_version
    }

    /// Name an original method would be moved to when rebasing.
    pub fn rebased_method_name(&self, method: &str) -> String {
        self.name_transformer.transform(method)
    }

    pub fn define_field(
        &mut self,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        access: u16,
    ) -> Result<&mut Self> {
        let name = name.into();
        if !self.entry_point.allows_structural_changes() {
            bail!(
                "Cannot define field {name} on {}: entry point {} does not allow structural changes",
                self.class.name()?,
                self.entry_point
            );
        }
        if self.fields.iter().any(|f| f.name == name) {
            bail!("Field {name} is already defined by another plugin");
        }
        self.fields.push(FieldDefinition {
            access,
            name,
            descriptor: descriptor.into(),
        });
        Ok(self)
    }

    /// Marks the type as needing an initializer that must run when the type
    /// is loaded.
    pub fn require_live_initializer(&mut self) -> &mut Self {
        self.live_initializer = true;
        self
    }

    pub fn has_live_initializer(&self) -> bool {
        self.live_initializer
    }

    pub fn is_modified(&self) -> bool {
        !self.fields.is_empty() || self.live_initializer
    }

    pub fn make(&self) -> Result<Vec<u8>> {
        self.class.with_fields(&self.fields)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    SourceRoot,
    Logger,
    BuildLogger,
}

#[derive(Clone)]
pub enum Argument {
    String(String),
    Integer(i64),
    Boolean(bool),
    SourceRoot(PathBuf),
    Logger(TaskLogger),
    BuildLogger(Arc<dyn BuildLogger>),
}

impl Argument {
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::String(_) => ParamKind::String,
            Self::Integer(_) => ParamKind::Integer,
            Self::Boolean(_) => ParamKind::Boolean,
            Self::SourceRoot(_) => ParamKind::SourceRoot,
            Self::Logger(_) => ParamKind::Logger,
            Self::BuildLogger(_) => ParamKind::BuildLogger,
        }
    }
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => write!(f, "{v:?}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::SourceRoot(v) => write!(f, "{}", v.display()),
            Self::Logger(v) => write!(f, "Logger({})", v.name()),
            Self::BuildLogger(_) => f.write_str("BuildLogger"),
        }
    }
}

/// Resolved constructor arguments, indexed like the constructor's parameters.
#[derive(Debug, Clone)]
pub struct Arguments(Vec<Argument>);

impl Arguments {
    pub fn new(values: Vec<Argument>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn get(&self, index: usize) -> Result<&Argument> {
        self.0
            .get(index)
            .ok_or_else(|| anyhow!("Missing constructor argument {index}"))
    }

    pub fn string(&self, index: usize) -> Result<String> {
        match self.get(index)? {
            Argument::String(v) => Ok(v.clone()),
            other => Err(anyhow!("Argument {index} is not a string: {other:?}")),
        }
    }

    pub fn integer(&self, index: usize) -> Result<i64> {
        match self.get(index)? {
            Argument::Integer(v) => Ok(*v),
            other => Err(anyhow!("Argument {index} is not an integer: {other:?}")),
        }
    }

    pub fn boolean(&self, index: usize) -> Result<bool> {
        match self.get(index)? {
            Argument::Boolean(v) => Ok(*v),
            other => Err(anyhow!("Argument {index} is not a boolean: {other:?}")),
        }
    }

    pub fn source_root(&self, index: usize) -> Result<&Path> {
        match self.get(index)? {
            Argument::SourceRoot(v) => Ok(v),
            other => Err(anyhow!("Argument {index} is not a source root: {other:?}")),
        }
    }

    pub fn logger(&self, index: usize) -> Result<TaskLogger> {
        match self.get(index)? {
            Argument::Logger(v) => Ok(v.clone()),
            other => Err(anyhow!("Argument {index} is not a logger: {other:?}")),
        }
    }

    pub fn build_logger(&self, index: usize) -> Result<Arc<dyn BuildLogger>> {
        match self.get(index)? {
            Argument::BuildLogger(v) => Ok(Arc::clone(v)),
            other => Err(anyhow!("Argument {index} is not a build logger: {other:?}")),
        }
    }
}

pub type ConstructorFn = fn(&Arguments) -> Result<Box<dyn Plugin>>;

#[derive(Clone)]
pub struct Constructor {
    params: Vec<ParamKind>,
    make: ConstructorFn,
}

impl Constructor {
    pub fn new(params: Vec<ParamKind>, make: ConstructorFn) -> Self {
        Self { params, make }
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn invoke(&self, arguments: &Arguments) -> Result<Box<dyn Plugin>> {
        if arguments.len() != self.params.len() {
            bail!(
                "Constructor expects {} arguments but got {}",
                self.params.len(),
                arguments.len()
            );
        }
        (self.make)(arguments)
    }
}

impl fmt::Debug for Constructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Constructor").field(&self.params).finish()
    }
}

/// A typed handle to a plugin implementation: its name and constructors.
/// Holding one never instantiates the plugin.
#[derive(Debug, Clone)]
pub struct PluginType {
    name: String,
    constructors: Vec<Constructor>,
}

impl PluginType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructors: Vec::new(),
        }
    }

    pub fn constructor(mut self, params: Vec<ParamKind>, make: ConstructorFn) -> Self {
        self.constructors.push(Constructor::new(params, make));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constructors(&self) -> &[Constructor] {
        &self.constructors
    }
}

#[derive(Debug, Serialize)]
pub struct PluginListing {
    pub name: String,
    pub extension: bool,
    pub constructors: Vec<Vec<ParamKind>>,
}

/// System types are visible through every loader. Extension types are only
/// visible through a loader whose class path declares them.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    system: BTreeMap<String, Arc<PluginType>>,
    extensions: BTreeMap<String, Arc<PluginType>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the plugins shipped with this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::plugins::register_builtin(&mut registry);
        registry
    }

    pub fn register(&mut self, plugin: PluginType) -> Arc<PluginType> {
        let plugin = Arc::new(plugin);
        self.system
            .insert(plugin.name().to_string(), Arc::clone(&plugin));
        plugin
    }

    pub fn register_extension(&mut self, plugin: PluginType) -> Arc<PluginType> {
        let plugin = Arc::new(plugin);
        self.extensions
            .insert(plugin.name().to_string(), Arc::clone(&plugin));
        plugin
    }

    pub fn system(&self, name: &str) -> Option<Arc<PluginType>> {
        self.system.get(name).cloned()
    }

    pub fn extension(&self, name: &str) -> Option<Arc<PluginType>> {
        self.extensions.get(name).cloned()
    }

    pub fn listing(&self) -> Vec<PluginListing> {
        let entry = |plugin: &Arc<PluginType>, extension: bool| PluginListing {
            name: plugin.name().to_string(),
            extension,
            constructors: plugin
                .constructors()
                .iter()
                .map(|c| c.params().to_vec())
                .collect(),
        };
        self.system
            .values()
            .map(|p| entry(p, false))
            .chain(self.extensions.values().map(|p| entry(p, true)))
            .collect()
    }
}
