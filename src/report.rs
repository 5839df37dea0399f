//! Engine event reporting: listeners, error handlers and the loggers handed
//! to plugins.
//!
//! Listeners observe; error handlers may veto by returning an error. Both are
//! invoked from dispatcher workers and must tolerate concurrent calls.

use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::fmt;

use crate::classfile::TypeDescription;

/// Named logger for one task, writing through `tracing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLogger {
    name: String,
}

impl TaskLogger {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_debug_enabled(&self) -> bool {
        tracing::enabled!(tracing::Level::DEBUG)
    }

    pub fn is_info_enabled(&self) -> bool {
        tracing::enabled!(tracing::Level::INFO)
    }

    pub fn is_warn_enabled(&self) -> bool {
        tracing::enabled!(tracing::Level::WARN)
    }

    pub fn is_error_enabled(&self) -> bool {
        tracing::enabled!(tracing::Level::ERROR)
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(task = %self.name, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(task = %self.name, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(task = %self.name, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(task = %self.name, "{message}");
    }
}

/// Leveled logging capability offered to plugin constructors.
pub trait BuildLogger: Send + Sync {
    fn is_debug_enabled(&self) -> bool;
    fn debug(&self, message: &str);
    fn is_info_enabled(&self) -> bool;
    fn info(&self, message: &str);
    fn is_warn_enabled(&self) -> bool;
    fn warn(&self, message: &str);
    fn is_error_enabled(&self) -> bool;
    fn error(&self, message: &str);

    fn debug_with(&self, message: &str, error: &anyhow::Error) {
        self.debug(&format!("{message}: {error:#}"));
    }

    fn info_with(&self, message: &str, error: &anyhow::Error) {
        self.info(&format!("{message}: {error:#}"));
    }

    fn warn_with(&self, message: &str, error: &anyhow::Error) {
        self.warn(&format!("{message}: {error:#}"));
    }

    fn error_with(&self, message: &str, error: &anyhow::Error) {
        self.error(&format!("{message}: {error:#}"));
    }
}

#[derive(Debug, Clone)]
pub struct TaskBuildLogger {
    logger: TaskLogger,
}

impl TaskBuildLogger {
    pub fn new(logger: TaskLogger) -> Self {
        Self { logger }
    }
}

impl BuildLogger for TaskBuildLogger {
    fn is_debug_enabled(&self) -> bool {
        self.logger.is_debug_enabled()
    }

    fn debug(&self, message: &str) {
        self.logger.debug(message);
    }

    fn is_info_enabled(&self) -> bool {
        self.logger.is_info_enabled()
    }

    fn info(&self, message: &str) {
        self.logger.info(message);
    }

    fn is_warn_enabled(&self) -> bool {
        self.logger.is_warn_enabled()
    }

    fn warn(&self, message: &str) {
        self.logger.warn(message);
    }

    fn is_error_enabled(&self) -> bool {
        self.logger.is_error_enabled()
    }

    fn error(&self, message: &str) {
        self.logger.error(message);
    }
}

pub trait Listener: Send + Sync {
    fn on_discovery(&self, _type_name: &str) {}

    fn on_transformation(&self, _type_description: &TypeDescription, _plugins: &[&str]) {}

    fn on_ignored(&self, _type_description: &TypeDescription, _plugins: &[&str]) {}

    fn on_error(&self, _type_description: &TypeDescription, _plugin: &str, _error: &anyhow::Error) {}

    fn on_failure(&self, _type_description: &TypeDescription, _errors: &[anyhow::Error]) {}

    fn on_errors(&self, _failed: &BTreeMap<String, Vec<String>>) {}

    fn on_close_error(&self, _plugin: &str, _error: &anyhow::Error) {}

    fn on_live_initializer(&self, _type_description: &TypeDescription, _defining_type: &TypeDescription) {}

    fn on_unresolved(&self, _type_name: &str) {}

    fn on_resource(&self, _name: &str) {}

    fn on_complete(&self, _type_description: &TypeDescription) {}
}

/// Engine hooks that can abort processing. An `Err` from
/// `on_live_initializer` fails that type; from any other hook it aborts the
/// run.
pub trait ErrorHandler: Send + Sync + fmt::Debug {
    fn on_error(&self, _type_description: &TypeDescription, _plugin: &str, _error: &anyhow::Error) -> Result<()> {
        Ok(())
    }

    fn on_failure(&self, _type_description: &TypeDescription, _errors: &[anyhow::Error]) -> Result<()> {
        Ok(())
    }

    fn on_errors(&self, _failed: &BTreeMap<String, Vec<String>>) -> Result<()> {
        Ok(())
    }

    fn on_live_initializer(&self, _type_description: &TypeDescription, _defining_type: &TypeDescription) -> Result<()> {
        Ok(())
    }

    fn on_unresolved(&self, _type_name: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcing {
    AllTypesResolved,
    NoLiveInitializers,
}

impl ErrorHandler for Enforcing {
    fn on_live_initializer(&self, type_description: &TypeDescription, defining_type: &TypeDescription) -> Result<()> {
        if *self == Self::NoLiveInitializers {
            bail!(
                "Failed to instrument {type_description} since it contains a live initializer for {defining_type}"
            );
        }
        Ok(())
    }

    fn on_unresolved(&self, type_name: &str) -> Result<()> {
        if *self == Self::AllTypesResolved {
            bail!("Failed to resolve type description for {type_name}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failing {
    FailFast,
    FailLast,
}

impl ErrorHandler for Failing {
    fn on_error(&self, type_description: &TypeDescription, plugin: &str, error: &anyhow::Error) -> Result<()> {
        if *self == Self::FailFast {
            bail!("Failed to transform {type_description} using {plugin}: {error:#}");
        }
        Ok(())
    }

    fn on_errors(&self, failed: &BTreeMap<String, Vec<String>>) -> Result<()> {
        if *self == Self::FailLast && !failed.is_empty() {
            bail!("Failed to transform at least one type: {failed:?}");
        }
        Ok(())
    }
}

/// Forwards engine events to the task logger.
#[derive(Debug, Clone)]
pub struct TransformationLogger {
    logger: TaskLogger,
}

impl TransformationLogger {
    pub fn new(logger: TaskLogger) -> Self {
        Self { logger }
    }
}

impl Listener for TransformationLogger {
    fn on_transformation(&self, type_description: &TypeDescription, plugins: &[&str]) {
        if self.logger.is_debug_enabled() {
            self.logger
                .debug(&format!("Transformed {type_description} using {plugins:?}"));
        }
    }

    fn on_error(&self, type_description: &TypeDescription, plugin: &str, error: &anyhow::Error) {
        self.logger.warn(&format!(
            "Failed to transform {type_description} using {plugin}: {error:#}"
        ));
    }

    fn on_errors(&self, failed: &BTreeMap<String, Vec<String>>) {
        self.logger
            .warn(&format!("Failed to transform {} types", failed.len()));
    }

    fn on_close_error(&self, plugin: &str, error: &anyhow::Error) {
        self.logger
            .error(&format!("Failed to close {plugin}: {error:#}"));
    }

    fn on_live_initializer(&self, type_description: &TypeDescription, defining_type: &TypeDescription) {
        if self.logger.is_debug_enabled() {
            self.logger.debug(&format!(
                "Discovered live initializer for {defining_type} as a result of transforming {type_description}"
            ));
        }
    }

    fn on_unresolved(&self, type_name: &str) {
        self.logger
            .warn(&format!("Could not resolve type description for {type_name}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ClassFileVersion;

    fn description(name: &str) -> TypeDescription {
        TypeDescription {
            name: name.to_string(),
            access: 0,
            version: ClassFileVersion::JAVA_V8,
            super_name: Some("java.lang.Object".to_string()),
            interfaces: Vec::new(),
            fields: None,
            methods: None,
        }
    }

    #[test]
    fn enforcing_handlers_only_veto_their_own_concern() {
        let foo = description("a.Foo");
        assert!(Enforcing::AllTypesResolved.on_unresolved("a.Missing").is_err());
        assert!(Enforcing::AllTypesResolved.on_live_initializer(&foo, &foo).is_ok());
        assert!(Enforcing::NoLiveInitializers.on_live_initializer(&foo, &foo).is_err());
        assert!(Enforcing::NoLiveInitializers.on_unresolved("a.Missing").is_ok());
    }

    #[test]
    fn failing_handlers_abort_first_or_last() {
        let foo = description("a.Foo");
        let error = anyhow::anyhow!("boom");
        assert!(Failing::FailFast.on_error(&foo, "P", &error).is_err());
        assert!(Failing::FailLast.on_error(&foo, "P", &error).is_ok());

        let mut failed = BTreeMap::new();
        assert!(Failing::FailLast.on_errors(&failed).is_ok());
        failed.insert("a.Foo".to_string(), vec!["boom".to_string()]);
        assert!(Failing::FailLast.on_errors(&failed).is_err());
        assert!(Failing::FailFast.on_errors(&failed).is_ok());
    }

    #[test]
    fn build_logger_delegates_to_task_logger() {
        let logger: Box<dyn BuildLogger> = Box::new(TaskBuildLogger::new(TaskLogger::new("byteBuddy")));
        logger.info("hello");
        logger.warn_with("careful", &anyhow::anyhow!("detail"));
        let _ = logger.is_debug_enabled();
    }
}
