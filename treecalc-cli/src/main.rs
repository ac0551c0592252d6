//! # treecalc CLI
//!
//! Load a YAML model and inspect how its rules compile and compute.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "treecalc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the model file
    #[arg(long, default_value = "model.yml", env = "TREECALC_MODEL")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical expression of an item's rule
    Key {
        /// Item path, absolute or relative to the model root
        path: String,
    },

    /// List the items an item's rule depends on
    Suppliers {
        /// Item path
        path: String,
    },

    /// Compute an item and print its values
    Eval {
        /// Item path
        path: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,

        /// Print engine counters after computing
        #[arg(long)]
        stats: bool,
    },

    /// Compile every rule in the model and report failures
    Check {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the item tree
    Tree,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::INFO.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Key { path } => commands::show_key(&cli.config, &path),
        Commands::Suppliers { path } => commands::show_suppliers(&cli.config, &path),
        Commands::Eval { path, json, stats } => commands::eval_item(&cli.config, &path, json, stats),
        Commands::Check { json } => commands::check_model(&cli.config, json),
        Commands::Tree => commands::print_tree(&cli.config),
    }
}
