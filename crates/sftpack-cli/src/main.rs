use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rayon::prelude::*;
use serde::Serialize;

use sftpack_core::{LengthTable, PackerConfig};
use sftpack_data::{SamplerSession, TokenizedDataset};
use sftpack_optim::{SchedulerKind, TrainingBudget};

const BANNER: &str = r#"
      __ _                    _
 ___ / _| |_ _ __   __ _  ___| | __
/ __| |_| __| '_ \ / _` |/ __| |/ /
\__ \  _| |_| |_) | (_| | (__|   <
|___/_|  \__| .__/ \__,_|\___|_|\_\
            |_|"#;

#[derive(Parser)]
#[command(
    name = "sftpack",
    about = "Distributed length-aware batch packer for fine-tuning",
    long_about = "Plan and verify multipack batches offline.\n\nEvery worker derives the same global plan from (seed, epoch) and keeps\nonly its own rank's batches, so no coordination is needed at train time.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show version and the pinned packing algorithm
    Info,
    /// Pack one epoch for one rank and report (or write) its batches
    Plan {
        #[command(flatten)]
        pack: PackArgs,
        /// Epoch to plan
        #[arg(long, default_value = "0")]
        epoch: u64,
        /// Write this rank's batches as JSON to this path
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Simulate every rank independently and check they agree
    Verify {
        #[command(flatten)]
        pack: PackArgs,
        /// Number of epochs to check, starting at 0
        #[arg(long, default_value = "3")]
        epochs: u64,
    },
    /// Print the step budget and a sampled LR curve for a dataset
    Schedule {
        #[command(flatten)]
        pack: PackArgs,
        /// Training epochs
        #[arg(long, default_value = "3")]
        epochs: usize,
        /// Peak learning rate
        #[arg(long, default_value = "2e-5")]
        lr: f32,
        /// LR scheduler: cosine (with warmup), cosine_no_warmup, constant
        #[arg(long, default_value = "cosine")]
        scheduler: SchedulerKind,
        /// Fraction of total steps used for warmup
        #[arg(long, default_value = "0.05")]
        warmup_ratio: f64,
        /// Number of LR samples to print
        #[arg(long, default_value = "10")]
        points: usize,
    },
}

/// Inputs shared by every packing subcommand.
#[derive(clap::Args, Debug, Clone, Default)]
struct PackArgs {
    /// Lengths file: one integer per line, or `.jsonl` records with `input_ids`
    #[arg(long, value_name = "PATH")]
    lengths: PathBuf,

    /// JSON packer config; flags below override its fields
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Token budget per batch
    #[arg(long)]
    batch_max_length: Option<usize>,

    /// Examples per batch; with --max-length sets the budget to their product
    #[arg(long, requires = "max_length")]
    batch_size: Option<usize>,

    /// Maximum tokens per example
    #[arg(long)]
    max_length: Option<usize>,

    /// Number of data-parallel workers
    #[arg(long)]
    num_replicas: Option<usize>,

    /// This worker's rank
    #[arg(long)]
    rank: Option<usize>,

    /// Base randomness seed
    #[arg(long)]
    seed: Option<u64>,

    /// Enable replica sharding
    #[arg(long)]
    distributed: bool,
}

impl PackArgs {
    /// Budget from `--batch-max-length`, or `--batch-size * --max-length`.
    fn budget_override(&self) -> Result<Option<usize>> {
        match (self.batch_max_length, self.batch_size, self.max_length) {
            (Some(b), _, _) => Ok(Some(b)),
            (None, Some(bs), Some(ml)) => {
                Ok(Some(PackerConfig::from_batch_size(bs, ml, 0)?.batch_max_length))
            }
            _ => Ok(None),
        }
    }

    /// Merge the config file (if any) with command-line overrides.
    fn resolve_config(&self) -> Result<PackerConfig> {
        self.resolve_config_with(false)
    }

    /// Like `resolve_config`, with sharding forced on when `distributed` is set.
    fn resolve_config_with(&self, distributed: bool) -> Result<PackerConfig> {
        let budget = self.budget_override()?;
        let mut config = match (&self.config, budget) {
            (Some(path), _) => PackerConfig::from_json_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            (None, Some(b)) => PackerConfig::single(b, 0),
            (None, None) => {
                bail!("need --config, --batch-max-length, or --batch-size with --max-length")
            }
        };

        if let Some(b) = budget {
            config.batch_max_length = b;
        }
        if let Some(n) = self.num_replicas {
            config.num_replicas = n;
        }
        if let Some(r) = self.rank {
            config.rank = r;
        }
        if let Some(s) = self.seed {
            config.seed = s;
        }
        if self.distributed || distributed {
            config.use_distributed_shuffle = true;
        }
        if config.num_replicas > 1 && !config.use_distributed_shuffle {
            tracing::warn!(
                num_replicas = config.num_replicas,
                "sharding disabled; pass --distributed to split batches across replicas"
            );
        }

        config.validate()?;
        Ok(config)
    }
}

fn load_lengths(path: &Path) -> Result<LengthTable> {
    let is_jsonl = path.extension().and_then(|e| e.to_str()) == Some("jsonl");
    let table = if is_jsonl {
        TokenizedDataset::from_jsonl(path)?.lengths()?
    } else {
        LengthTable::read_lengths_file(path)?
    };
    tracing::info!(
        examples = table.len(),
        total_tokens = table.total_tokens(),
        max_length = table.max_length(),
        "loaded lengths from {}",
        path.display()
    );
    Ok(table)
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Info => {
            cmd_info();
            Ok(())
        }
        Commands::Plan { pack, epoch, output } => cmd_plan(&pack, epoch, output.as_deref()),
        Commands::Verify { pack, epochs } => cmd_verify(&pack, epochs),
        Commands::Schedule { pack, epochs, lr, scheduler, warmup_ratio, points } => {
            cmd_schedule(&pack, epochs, lr, scheduler, warmup_ratio, points)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn cmd_info() {
    let version = sftpack_core::PackingVersion::default();
    println!("{}", BANNER);
    println!("  v{}  -  multipack batch planner\n", env!("CARGO_PKG_VERSION"));
    println!("Packing algorithm");
    println!("  version: {}", version);
    println!("  {}", version.describe());
    println!("\nCrates");
    let crates = [
        ("core", "PackerConfig, LengthTable, PackError"),
        ("data", "Permutation, packer, sharder, sampler, collators"),
        ("optim", "Step budget, LR schedulers"),
        ("cli", "This CLI"),
    ];
    for (name, desc) in crates {
        println!("  sftpack-{:<7} {}", name, desc);
    }
}

/// JSON written by `plan --output`.
#[derive(Serialize)]
struct PlanReport {
    config: PackerConfig,
    epoch: u64,
    global_batches: usize,
    num_batches: usize,
    efficiency: f64,
    batches: Vec<Vec<usize>>,
}

fn cmd_plan(pack: &PackArgs, epoch: u64, output: Option<&Path>) -> Result<()> {
    let config = pack.resolve_config()?;
    let lengths = load_lengths(&pack.lengths)?;
    let mut session = SamplerSession::new(config.clone(), lengths)?;
    session.set_epoch(epoch);

    let plan = session.plan()?;
    let batches: Vec<Vec<usize>> = session.iter()?.map(|b| b.into_indices()).collect();
    let sharder = session.sharder();

    println!("=== sftpack plan ===");
    println!("Epoch:            {}", epoch);
    println!("batch_max_length: {}", config.batch_max_length);
    println!("Replicas:         {} (rank {})", sharder.num_replicas(), sharder.rank());
    println!("Global batches:   {}", plan.len());
    println!("Dropped tail:     {}", plan.len() - sharder.usable(plan.len()));
    println!("Rank batches:     {}", batches.len());
    println!("Efficiency:       {:.2}%", plan.efficiency() * 100.0);

    if let Some(path) = output {
        let report = PlanReport {
            config,
            epoch,
            global_batches: plan.len(),
            num_batches: batches.len(),
            efficiency: plan.efficiency(),
            batches,
        };
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {}", path.display());
    }

    Ok(())
}

/// Outcome of checking one epoch across all ranks.
#[derive(Debug, PartialEq)]
struct EpochCheck {
    epoch: u64,
    global_batches: usize,
    per_rank: Vec<usize>,
    /// Examples trained on this epoch across all ranks.
    covered_examples: usize,
    /// Examples in the dropped tail batches.
    dropped_examples: usize,
}

/// Build each rank's session independently and confirm they agree.
///
/// Checks that the global plan places every example exactly once, that every
/// rank gets the same number of batches, and that the ranks' batches are
/// exactly the usable prefix of the global plan with no example repeated.
fn verify_epoch(
    config: &PackerConfig,
    lengths: &Arc<LengthTable>,
    epoch: u64,
) -> Result<EpochCheck> {
    let replicas = config.num_replicas;

    let per_rank: Vec<(usize, Vec<Vec<usize>>)> = (0..replicas)
        .into_par_iter()
        .map(|rank| -> Result<(usize, Vec<Vec<usize>>)> {
            let mut session =
                SamplerSession::with_shared_lengths(config.with_rank(rank), lengths.clone())?;
            session.set_epoch(epoch);
            let count = session.num_batches()?;
            let batches = session.iter()?.map(|b| b.into_indices()).collect();
            Ok((count, batches))
        })
        .collect::<Result<_>>()?;

    let counts: Vec<usize> = per_rank.iter().map(|(c, _)| *c).collect();
    if counts.iter().any(|&c| c != counts[0]) {
        bail!("epoch {epoch}: ranks disagree on num_batches: {counts:?}");
    }

    let reference = SamplerSession::with_shared_lengths(config.with_rank(0), lengths.clone())?
        .plan_for_epoch(epoch)?;

    let mut placed: Vec<usize> =
        reference.iter().flat_map(|b| b.indices().iter().copied()).collect();
    placed.sort_unstable();
    if !placed.iter().copied().eq(0..lengths.len()) {
        bail!(
            "epoch {epoch}: global plan places {} indices, expected each of 0..{} once",
            placed.len(),
            lengths.len()
        );
    }

    let usable = reference.len() - reference.len() % replicas;
    if counts[0] * replicas != usable {
        bail!("epoch {epoch}: {} batches per rank, expected {}", counts[0], usable / replicas);
    }

    let mut seen = HashSet::new();
    for (rank, (_, batches)) in per_rank.iter().enumerate() {
        for (i, batch) in batches.iter().enumerate() {
            let global = reference.get(i * replicas + rank).map(|b| b.indices());
            if global != Some(batch.as_slice()) {
                bail!("epoch {epoch}: rank {rank} batch {i} differs from global plan");
            }
            for &idx in batch {
                if !seen.insert(idx) {
                    bail!("epoch {epoch}: example {idx} assigned twice");
                }
            }
        }
    }

    let usable_members: usize = reference.batches()[..usable].iter().map(|b| b.len()).sum();
    if seen.len() != usable_members {
        bail!(
            "epoch {epoch}: ranks cover {} examples, usable batches hold {usable_members}",
            seen.len()
        );
    }

    Ok(EpochCheck {
        epoch,
        global_batches: reference.len(),
        per_rank: counts,
        covered_examples: seen.len(),
        dropped_examples: lengths.len() - usable_members,
    })
}

fn cmd_verify(pack: &PackArgs, epochs: u64) -> Result<()> {
    let config = pack.resolve_config_with(true)?;
    let lengths = Arc::new(load_lengths(&pack.lengths)?);

    println!("=== sftpack verify ({} replicas) ===", config.num_replicas);
    println!(
        "{:<8} {:>10} {:>12} {:>10} {:>10}",
        "Epoch", "Global", "Per rank", "Examples", "Dropped"
    );
    println!("{}", "-".repeat(54));

    for epoch in 0..epochs {
        let check = verify_epoch(&config, &lengths, epoch)?;
        println!(
            "{:<8} {:>10} {:>12} {:>10} {:>10}",
            check.epoch,
            check.global_batches,
            check.per_rank[0],
            check.covered_examples,
            check.dropped_examples,
        );
    }

    println!("\nAll ranks agree.");
    Ok(())
}

fn cmd_schedule(
    pack: &PackArgs,
    epochs: usize,
    lr: f32,
    kind: SchedulerKind,
    warmup_ratio: f64,
    points: usize,
) -> Result<()> {
    let config = pack.resolve_config()?;
    let lengths = load_lengths(&pack.lengths)?;
    let session = SamplerSession::new(config, lengths)?;

    let budget =
        TrainingBudget::new(session.num_batches()?, epochs).with_warmup_ratio(warmup_ratio);
    let sched = kind.build(lr, &budget);

    println!("=== sftpack schedule ===");
    println!("[STEPS PER EPOCH]: {}", budget.steps_per_epoch);
    if kind.uses_warmup() {
        println!("[WARMUP STEPS]:    {}", budget.warmup_steps());
    }
    println!("[MAX STEPS]:       {}", budget.total_steps());
    println!("[SCHEDULER]:       {}", kind);

    let total = budget.total_steps();
    if total == 0 || points == 0 {
        return Ok(());
    }

    println!("\n{:<8} {:>14}", "Step", "LR");
    println!("{}", "-".repeat(23));
    let stride = (total / points).max(1);
    let mut steps: Vec<usize> = (0..total).step_by(stride).collect();
    if steps.last() != Some(&(total - 1)) {
        steps.push(total - 1);
    }
    for step in steps {
        println!("{:<8} {:>14.10}", step, sched.get_lr(step));
    }

    Ok(())
}
