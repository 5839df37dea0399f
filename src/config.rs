//! Task configuration: the JSON task file plus command-line overrides.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::classfile::ClassFileVersion;
use crate::cli::{Cli, Commands, ResolverArg};
use crate::engine::EntryPoint;
use crate::error::TaskError;
use crate::factory::ArgumentResolver;
use crate::incremental::IncrementalStrategy;

pub const JAVA_ENV: &str = "CLASS_TRANSFORM_JAVA";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub class_path: Vec<PathBuf>,
    pub transformations: Vec<TransformationSpec>,
    pub entry_point: Option<EntryPoint>,
    pub initialization: Option<Initialization>,
    pub suffix: String,
    pub fail_on_live_initializer: bool,
    pub warn_on_empty_type_set: bool,
    pub fail_fast: bool,
    pub extended_parsing: bool,
    pub threads: usize,
    pub incremental: bool,
    pub incremental_resolver: IncrementalStrategy,
    pub target_compatibility: Option<Compatibility>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            class_path: Vec::new(),
            transformations: Vec::new(),
            entry_point: None,
            initialization: None,
            suffix: String::new(),
            fail_on_live_initializer: false,
            warn_on_empty_type_set: false,
            fail_fast: false,
            extended_parsing: false,
            threads: 0,
            incremental: true,
            incremental_resolver: IncrementalStrategy::default(),
            target_compatibility: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationSpec {
    pub plugin: String,
    #[serde(default)]
    pub arguments: Vec<PluginArgument>,
    #[serde(default)]
    pub class_path: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginArgument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initialization {
    pub entry_point: EntryPoint,
}

/// `8`, `"1.8"` and `"17"` are all accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Compatibility {
    Release(u16),
    Version(String),
}

impl Compatibility {
    pub fn class_file_version(&self) -> Result<ClassFileVersion> {
        match self {
            Self::Release(release) => ClassFileVersion::of_java(*release),
            Self::Version(version) => ClassFileVersion::parse_java_version(version),
        }
    }
}

impl TransformationSpec {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            arguments: Vec::new(),
            class_path: Vec::new(),
        }
    }

    pub fn argument(mut self, value: impl Into<Value>) -> Self {
        self.arguments.push(PluginArgument {
            index: None,
            value: value.into(),
        });
        self
    }

    pub fn argument_resolvers(&self) -> Vec<ArgumentResolver> {
        argument_resolvers(&self.arguments)
    }
}

/// Resolvers for user arguments. Arguments with an explicit index come
/// first; the others bind to their position in the list.
pub fn argument_resolvers(arguments: &[PluginArgument]) -> Vec<ArgumentResolver> {
    let explicit = arguments.iter().filter_map(|argument| {
        argument
            .index
            .map(|index| ArgumentResolver::for_index(index, argument.value.clone()))
    });
    let positional = arguments
        .iter()
        .enumerate()
        .filter(|(_, argument)| argument.index.is_none())
        .map(|(position, argument)| ArgumentResolver::for_index(position, argument.value.clone()));
    explicit.chain(positional).collect()
}

impl TaskConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task configuration: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse task configuration: {}", path.display()))
    }

    pub fn entry_point(&self) -> EntryPoint {
        self.initialization
            .map(|initialization| initialization.entry_point)
            .or(self.entry_point)
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.entry_point.is_some() && self.initialization.is_some() {
            return Err(TaskError::invalid("Initialization is already set"));
        }
        if self.source.is_none() {
            return Err(TaskError::invalid("Source folder is not set"));
        }
        if self.target.is_none() {
            return Err(TaskError::invalid("Target folder is not set"));
        }
        if self
            .transformations
            .iter()
            .any(|transformation| transformation.plugin.trim().is_empty())
        {
            return Err(TaskError::invalid("Plugin name was not specified or is empty"));
        }
        Ok(())
    }

    /// Distinct class-path entries in declaration order.
    pub fn class_path_entries(&self) -> Vec<PathBuf> {
        let mut seen = BTreeSet::new();
        self.class_path
            .iter()
            .filter(|entry| seen.insert(entry.to_path_buf()))
            .cloned()
            .collect()
    }
}

pub fn resolve_task_config(cli: &Cli) -> Result<TaskConfig> {
    let mut config = match &cli.config {
        Some(path) => TaskConfig::load(path)?,
        None => TaskConfig::default(),
    };

    if let Commands::Run {
        source,
        target,
        class_path,
        threads,
        fail_fast,
        no_incremental,
        resolver,
        ..
    } = &cli.command
    {
        if let Some(source) = source {
            config.source = Some(source.clone());
        }
        if let Some(target) = target {
            config.target = Some(target.clone());
        }
        config.class_path.extend(class_path.iter().cloned());
        if let Some(threads) = threads {
            config.threads = *threads;
        }
        if *fail_fast {
            config.fail_fast = true;
        }
        if *no_incremental {
            config.incremental = false;
        }
        match resolver {
            Some(ResolverArg::RootWidening) => {
                config.incremental_resolver = IncrementalStrategy::RootWidening;
            }
            Some(ResolverArg::LiteralChangeSet) => {
                config.incremental_resolver = IncrementalStrategy::LiteralChangeSet;
            }
            None => {}
        }
    }
    Ok(config)
}

pub fn resolve_state_path(cli: &Cli) -> Result<PathBuf> {
    if let Commands::Run {
        state: Some(path), ..
    } = &cli.command
    {
        return Ok(path.clone());
    }
    Ok(class_transform_home()?.join("state.lmdb"))
}

/// The class-file version of the `java` executable, from
/// `java.specification.version`.
pub fn host_class_file_version() -> Result<ClassFileVersion> {
    let java = env::var_os(JAVA_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("java"));
    let output = Command::new(&java)
        .args(["-XshowSettings:properties", "-version"])
        .output()
        .with_context(|| format!("Failed to run {}", java.display()))?;
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stderr),
        String::from_utf8_lossy(&output.stdout)
    );
    let version = specification_version(&text).ok_or_else(|| {
        anyhow!(
            "{} did not report java.specification.version",
            java.display()
        )
    })?;
    ClassFileVersion::parse_java_version(version)
}

fn specification_version(properties: &str) -> Option<&str> {
    properties.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "java.specification.version").then(|| value.trim())
    })
}

fn class_transform_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("class-transform"))
}
