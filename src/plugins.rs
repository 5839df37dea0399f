//! Plugins shipped with the tool.

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::classfile::{ACC_PUBLIC, ACC_STATIC, TypeDescription};
use crate::locator::ClassFileLocator;
use crate::plugin::{Arguments, ParamKind, Plugin, PluginRegistry, PluginType, TypeBuilder};
use crate::report::{BuildLogger, TaskLogger};

pub const DEFINE_FIELD: &str = "DefineField";
pub const INITIALIZATION_HOOK: &str = "InitializationHook";

const DEFAULT_FIELD_NAME: &str = "proofOfWork";
const DEFAULT_FIELD_DESCRIPTOR: &str = "Ljava/lang/Void;";
const HOOK_FIELD_NAME: &str = "$onLoad";
const HOOK_FIELD_DESCRIPTOR: &str = "Ljava/lang/Runnable;";

pub fn register_builtin(registry: &mut PluginRegistry) {
    use ParamKind::{BuildLogger as BuildLog, Logger, String as Str};

    registry.register(
        PluginType::new(DEFINE_FIELD)
            .constructor(vec![], define_field)
            .constructor(vec![Str], define_field)
            .constructor(vec![Str, Str], define_field)
            .constructor(vec![Str, Str, Str], define_field)
            .constructor(vec![Str, Str, Str, BuildLog], define_field),
    );
    registry.register(
        PluginType::new(INITIALIZATION_HOOK)
            .constructor(vec![], initialization_hook)
            .constructor(vec![Str], initialization_hook)
            .constructor(vec![Str, Logger], initialization_hook),
    );
}

/// Comma-separated simple names; an empty list selects every type.
fn simple_names(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn selects(names: &BTreeSet<String>, target: &TypeDescription) -> bool {
    !target.is_interface() && (names.is_empty() || names.contains(target.simple_name()))
}

pub struct DefineField {
    field_name: String,
    descriptor: String,
    names: BTreeSet<String>,
    logger: Option<Arc<dyn BuildLogger>>,
}

fn define_field(arguments: &Arguments) -> Result<Box<dyn Plugin>> {
    let optional = |index: usize| -> Result<Option<String>> {
        if index < arguments.len() {
            arguments.string(index).map(Some)
        } else {
            Ok(None)
        }
    };
    let logger = if arguments.len() > 3 {
        Some(arguments.build_logger(3)?)
    } else {
        None
    };
    Ok(Box::new(DefineField {
        field_name: optional(0)?.unwrap_or_else(|| DEFAULT_FIELD_NAME.to_string()),
        descriptor: optional(1)?.unwrap_or_else(|| DEFAULT_FIELD_DESCRIPTOR.to_string()),
        names: simple_names(&optional(2)?.unwrap_or_default()),
        logger,
    }))
}

impl Plugin for DefineField {
    fn name(&self) -> &str {
        DEFINE_FIELD
    }

    fn matches(&self, target: &TypeDescription) -> bool {
        selects(&self.names, target) && target.declares_field(&self.field_name) != Some(true)
    }

    fn apply(
        &self,
        builder: &mut TypeBuilder,
        type_description: &TypeDescription,
        _locator: &dyn ClassFileLocator,
    ) -> Result<()> {
        builder.define_field(&self.field_name, &self.descriptor, ACC_PUBLIC)?;
        if let Some(logger) = &self.logger
            && logger.is_debug_enabled()
        {
            logger.debug(&format!(
                "Defined {} {} on {type_description}",
                self.descriptor, self.field_name
            ));
        }
        Ok(())
    }
}

pub struct InitializationHook {
    names: BTreeSet<String>,
    logger: Option<TaskLogger>,
}

fn initialization_hook(arguments: &Arguments) -> Result<Box<dyn Plugin>> {
    let names = if arguments.is_empty() {
        BTreeSet::new()
    } else {
        simple_names(&arguments.string(0)?)
    };
    let logger = if arguments.len() > 1 {
        Some(arguments.logger(1)?)
    } else {
        None
    };
    Ok(Box::new(InitializationHook { names, logger }))
}

impl Plugin for InitializationHook {
    fn name(&self) -> &str {
        INITIALIZATION_HOOK
    }

    fn matches(&self, target: &TypeDescription) -> bool {
        selects(&self.names, target)
    }

    fn apply(
        &self,
        builder: &mut TypeBuilder,
        type_description: &TypeDescription,
        _locator: &dyn ClassFileLocator,
    ) -> Result<()> {
        builder
            .define_field(HOOK_FIELD_NAME, HOOK_FIELD_DESCRIPTOR, ACC_PUBLIC | ACC_STATIC)?
            .require_live_initializer();
        if let Some(logger) = &self.logger {
            logger.debug(&format!("Installed load hook on {type_description}"));
        }
        Ok(())
    }
}
