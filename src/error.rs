//! Errors raised by a transformation task run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    /// Rejected before anything was written.
    #[error("Invalid task configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to resolve plugin {plugin}")]
    PluginResolution {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to resolve entry point")]
    EntryPointResolution(#[source] anyhow::Error),

    #[error("Failed to configure transformation engine")]
    EngineConstruction(#[source] anyhow::Error),

    #[error("Failed to apply incremental change set")]
    Incremental(#[source] anyhow::Error),

    #[error("Failed to transform class files in {}", root.display())]
    Transformation {
        root: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to transform {count} types")]
    TransformationFailed {
        count: usize,
        failed: BTreeMap<String, Vec<String>>,
    },
}

impl TaskError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }
}
