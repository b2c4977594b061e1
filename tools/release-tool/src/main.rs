//! Release preparation tool for the Driftwave app shell.
//!
//! Provides commands for:
//! - Bumping the cache generation and version tag embedded in the worker
//! - Substituting deployment values into a config template
//!
//! ## Usage
//!
//! ```bash
//! # Increment the cache generation and stamp a date-based version
//! release-tool bump --dated-tag
//!
//! # Pin an explicit generation and tag
//! release-tool bump --generation 42 --tag 2026.08.05.1234
//!
//! # Fill the deployment config from the environment
//! release-tool substitute --template assets/app-config.template.js \
//!     --output assets/app-config.js \
//!     --key APP_API_KEY --key APP_ANALYTICS_ID
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod rewrite;

#[derive(Parser)]
#[command(name = "release-tool")]
#[command(about = "Release preparation for the Driftwave app shell")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bump the cache generation embedded in the worker source
    Bump {
        /// Worker source file carrying the embedded constants
        #[arg(
            long,
            default_value = "crates/driftwave-worker/src/version.rs"
        )]
        file: PathBuf,
        /// Explicit target generation (defaults to current + 1)
        #[arg(long)]
        generation: Option<u64>,
        /// Explicit version tag to embed
        #[arg(long, conflicts_with = "dated_tag")]
        tag: Option<String>,
        /// Embed a date-based version tag (YYYY.MM.DD.build)
        #[arg(long)]
        dated_tag: bool,
    },

    /// Substitute environment values into a config template
    Substitute {
        /// Template file containing placeholder tokens
        #[arg(long)]
        template: PathBuf,
        /// Output path (defaults to rewriting the template in place)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Placeholder token to replace with the same-named environment
        /// variable; repeatable
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Bump {
            file,
            generation,
            tag,
            dated_tag,
        } => {
            let tag = if dated_tag {
                Some(rewrite::dated_tag())
            } else {
                tag
            };
            run_bump(&file, generation, tag.as_deref())
        }
        Commands::Substitute {
            template,
            output,
            keys,
        } => run_substitute(&template, output.as_deref(), &keys),
    }
}

fn run_bump(file: &Path, generation: Option<u64>, tag: Option<&str>) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("worker source not found at {}", file.display()))?;

    let (rewritten, outcome) = rewrite::bump_source(&source, generation, tag)?;
    std::fs::write(file, rewritten)
        .with_context(|| format!("failed to write {}", file.display()))?;

    println!(
        "Cache generation updated from v{} to v{}",
        outcome.previous, outcome.next
    );
    if let Some(tag) = outcome.tag {
        println!("Version tag set to {tag}");
    }
    Ok(())
}

fn run_substitute(template: &Path, output: Option<&Path>, keys: &[String]) -> Result<()> {
    let source = std::fs::read_to_string(template)
        .with_context(|| format!("template not found at {}", template.display()))?;

    let rewritten = rewrite::substitute_source(&source, keys, |key| std::env::var(key).ok());

    let target = output.unwrap_or(template);
    std::fs::write(target, rewritten)
        .with_context(|| format!("failed to write {}", target.display()))?;

    println!(
        "Config written to {} ({} placeholders)",
        target.display(),
        keys.len()
    );
    Ok(())
}
