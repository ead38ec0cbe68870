//! Command line front end of the placement engine
//!
//! `place` runs one placement pass over a memory map, `merge` folds
//! co-runner fragments into it beforehand.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kmem_place::map::Fragment;
use kmem_place::{MemoryMapDocument, PlacementPolicy, SectionFactTable};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Move task and co-runner domains where the placement policy says
    Place {
        /// Placement configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Memory report of the first compilation
        #[arg(long)]
        memreport: Option<PathBuf>,

        /// Memory map to place into
        #[arg(long)]
        default_kmemory: Option<PathBuf>,

        /// Where to write the result, the default memory map if omitted
        #[arg(long)]
        out_kmemory: Option<PathBuf>,

        /// Task names bound to the task elements of the policy
        #[arg(long = "task")]
        tasks: Vec<String>,

        /// Co-runner names bound to the co-runner elements of the policy
        #[arg(long = "corunner")]
        corunners: Vec<String>,
    },

    /// Append co-runner memory map fragments to the largest region
    Merge {
        #[arg(long)]
        default_kmemory: PathBuf,

        #[arg(long)]
        out_kmemory: Option<PathBuf>,

        /// Co-runners whose stack objects get bound to their core
        #[arg(long = "corunner")]
        corunners: Vec<String>,

        #[arg(required = true)]
        fragments: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    match args.cmd {
        Cmd::Place {
            config,
            memreport,
            default_kmemory,
            out_kmemory,
            tasks,
            corunners,
        } => {
            let mut policy = PlacementPolicy::load(&config)
                .with_context(|| format!("can't read {}", config.display()))?;
            if !tasks.is_empty() || !corunners.is_empty() {
                policy.bind_owners(&tasks, &corunners);
            }

            let memreport = memreport
                .or_else(|| policy.memreport.clone())
                .ok_or_else(|| missing("memory report", &config))?;
            let default_kmemory = default_kmemory
                .or_else(|| policy.default_kmemory.clone())
                .ok_or_else(|| missing("memory map", &config))?;
            let out_kmemory = out_kmemory
                .or_else(|| policy.out_kmemory.clone())
                .unwrap_or_else(|| default_kmemory.clone());

            let facts = SectionFactTable::load(&memreport)
                .with_context(|| format!("can't read {}", memreport.display()))?;
            let mut document = MemoryMapDocument::load(&default_kmemory)
                .with_context(|| format!("can't read {}", default_kmemory.display()))?;

            kmem_place::place(&mut document, &facts, &policy).context("placement failed")?;

            document
                .save(&out_kmemory)
                .with_context(|| format!("can't write {}", out_kmemory.display()))?;
            tracing::info!(out = %out_kmemory.display(), "memory map written");
        }
        Cmd::Merge {
            default_kmemory,
            out_kmemory,
            corunners,
            fragments,
        } => {
            let mut document = MemoryMapDocument::load(&default_kmemory)
                .with_context(|| format!("can't read {}", default_kmemory.display()))?;
            for path in fragments.iter() {
                let fragment = Fragment::load(path)
                    .with_context(|| format!("can't read {}", path.display()))?;
                document
                    .merge_fragment(fragment)
                    .with_context(|| format!("can't merge {}", path.display()))?;
            }
            if !corunners.is_empty() {
                document
                    .bind_corunner_stacks(&corunners)
                    .context("can't bind co-runner stacks")?;
            }

            let out_kmemory = out_kmemory.unwrap_or(default_kmemory);
            document
                .save(&out_kmemory)
                .with_context(|| format!("can't write {}", out_kmemory.display()))?;
            tracing::info!(
                out = %out_kmemory.display(),
                fragments = fragments.len(),
                "memory map written"
            );
        }
    }
    Ok(())
}

fn missing(what: &str, config: &Path) -> anyhow::Error {
    anyhow!("no {} given, on the command line or in {}", what, config.display())
}
