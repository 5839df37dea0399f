use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "class-transform")]
#[command(about = "Incrementally rewrite compiled class files through a chain of plugins")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    Run {
        #[arg(long, value_name = "DIR")]
        source: Option<PathBuf>,

        #[arg(long, value_name = "DIR")]
        target: Option<PathBuf>,

        #[arg(long = "class-path", value_name = "PATH")]
        class_path: Vec<PathBuf>,

        #[arg(long, value_name = "N")]
        threads: Option<usize>,

        #[arg(long)]
        fail_fast: bool,

        #[arg(long)]
        no_incremental: bool,

        #[arg(long, value_enum)]
        resolver: Option<ResolverArg>,

        /// Ignore any stored snapshot and transform every class file.
        #[arg(long, conflicts_with = "changes")]
        full: bool,

        /// JSON list of `{file, kind}` change records to apply instead of the
        /// stored snapshot.
        #[arg(long, value_name = "FILE")]
        changes: Option<PathBuf>,

        #[arg(long, value_name = "FILE")]
        state: Option<PathBuf>,
    },
    Plugins,
    Layout {
        #[arg(long, value_name = "DIR")]
        classes_dir: PathBuf,

        #[arg(long, value_name = "NAME", default_value = "main")]
        source_set: String,

        #[arg(long = "dependent", value_name = "TASK")]
        dependents: Vec<String>,
    },
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum ResolverArg {
    RootWidening,
    LiteralChangeSet,
}
