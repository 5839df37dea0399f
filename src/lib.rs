//! # class-transform
//!
//! Incremental class-file transformation between a compiler's raw output
//! directory and the directory downstream build steps consume.
//!
//! ## Architecture
//!
//! - **change**: Change records, input changes and class-file base names
//! - **incremental**: Turns change records into files to re-process and outputs to purge
//! - **source**: Folder and explicit source views, elements and the target folder
//! - **locator**: Class-file lookup over folders and archives
//! - **classpath**: Plugin loaders keyed by class-path identity
//! - **classfile**: Class-file header reader, type descriptions and field emission
//! - **plugin**: Plugin contract, type builder and plugin registry
//! - **factory**: Constructor selection and argument resolution for plugins
//! - **plugins**: Built-in plugins
//! - **engine**: Applies plugins to every element of a source view
//! - **dispatcher**: Serial and thread-pool dispatch of engine work
//! - **report**: Engine listeners, error handlers and task loggers
//! - **state**: LMDB snapshot store used to detect changes between runs
//! - **registration**: Raw-output redirect and task graph rewiring
//! - **config**: Task configuration file and CLI overrides
//! - **task**: The transformation task run

pub mod change;
pub mod classfile;
pub mod classpath;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod factory;
pub mod incremental;
pub mod locator;
pub mod plugin;
pub mod plugins;
pub mod registration;
pub mod report;
pub mod source;
pub mod state;
pub mod task;
