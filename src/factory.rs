//! Plugin factories that pick a constructor by matching its parameters
//! against user arguments and ambient values.

use anyhow::{Result, anyhow};
use serde_json::Value;
use std::sync::Arc;

use crate::plugin::{Argument, Arguments, Constructor, ParamKind, Plugin, PluginType};

pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Creates a fresh plugin instance.
    fn make(&self) -> Result<Box<dyn Plugin>>;
}

#[derive(Debug, Clone)]
pub enum ArgumentResolver {
    /// A user value bound to one parameter position, converted to whatever
    /// kind that parameter declares.
    ForIndex { index: usize, value: Value },
    /// An ambient value bound to every parameter of its kind.
    ForType(Argument),
}

impl ArgumentResolver {
    pub fn for_index(index: usize, value: impl Into<Value>) -> Self {
        Self::ForIndex {
            index,
            value: value.into(),
        }
    }

    pub fn for_type(value: Argument) -> Self {
        Self::ForType(value)
    }

    pub fn resolve(&self, index: usize, kind: ParamKind) -> Option<Argument> {
        match self {
            Self::ForIndex { index: bound, value } if *bound == index => convert(value, kind),
            Self::ForIndex { .. } => None,
            Self::ForType(value) if value.kind() == kind => Some(value.clone()),
            Self::ForType(_) => None,
        }
    }
}

fn convert(value: &Value, kind: ParamKind) -> Option<Argument> {
    match kind {
        ParamKind::String => match value {
            Value::String(s) => Some(Argument::String(s.clone())),
            Value::Number(n) => Some(Argument::String(n.to_string())),
            Value::Bool(b) => Some(Argument::String(b.to_string())),
            _ => None,
        },
        ParamKind::Integer => match value {
            Value::Number(n) => n.as_i64().map(Argument::Integer),
            Value::String(s) => s.trim().parse().ok().map(Argument::Integer),
            _ => None,
        },
        ParamKind::Boolean => match value {
            Value::Bool(b) => Some(Argument::Boolean(*b)),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(Argument::Boolean(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(Argument::Boolean(false)),
            _ => None,
        },
        ParamKind::SourceRoot | ParamKind::Logger | ParamKind::BuildLogger => None,
    }
}

/// Instantiates a plugin type through the constructor with the most
/// parameters that every resolver together can satisfy.
#[derive(Debug, Clone)]
pub struct ReflectiveFactory {
    plugin: Arc<PluginType>,
    resolvers: Vec<ArgumentResolver>,
}

impl ReflectiveFactory {
    pub fn of(plugin: Arc<PluginType>) -> Self {
        Self {
            plugin,
            resolvers: Vec::new(),
        }
    }

    /// Appends resolvers. Earlier resolvers take precedence for the same
    /// parameter.
    pub fn with(mut self, resolvers: impl IntoIterator<Item = ArgumentResolver>) -> Self {
        self.resolvers.extend(resolvers);
        self
    }

    fn resolve(&self, constructor: &Constructor) -> Option<Arguments> {
        let mut values = Vec::with_capacity(constructor.arity());
        for (index, kind) in constructor.params().iter().enumerate() {
            let value = self
                .resolvers
                .iter()
                .find_map(|resolver| resolver.resolve(index, *kind))?;
            values.push(value);
        }
        Some(Arguments::new(values))
    }

    /// The chosen constructor and its arguments. Ties go to the constructor
    /// declared first.
    pub fn select(&self) -> Result<(&Constructor, Arguments)> {
        let mut best: Option<(&Constructor, Arguments)> = None;
        for constructor in self.plugin.constructors() {
            let Some(arguments) = self.resolve(constructor) else {
                continue;
            };
            if best
                .as_ref()
                .is_none_or(|(chosen, _)| constructor.arity() > chosen.arity())
            {
                best = Some((constructor, arguments));
            }
        }
        best.ok_or_else(|| {
            anyhow!(
                "No constructor of {} can be resolved from the supplied arguments; declared: {:?}",
                self.plugin.name(),
                self.plugin.constructors()
            )
        })
    }
}

impl PluginFactory for ReflectiveFactory {
    fn name(&self) -> &str {
        self.plugin.name()
    }

    fn make(&self) -> Result<Box<dyn Plugin>> {
        let (constructor, arguments) = self.select()?;
        constructor.invoke(&arguments)
    }
}
