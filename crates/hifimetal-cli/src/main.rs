//! hifimetal CLI - adversarial vocoder training tools.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use hifimetal_trainer::checkpoint::write_checkpoint_dir;
use hifimetal_trainer::{CheckpointManager, CheckpointState, GanTrainer, HifiGanConfig, ResumeState};

/// Output format for printed configurations.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum ConfigFormat {
    #[default]
    Yaml,
    Json,
}

#[derive(Parser)]
#[command(name = "hifimetal")]
#[command(author, version, about = "Adversarial vocoder training on Apple Silicon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a run configuration with every default filled in, after validation
    Config {
        /// Path to the run configuration (JSON or YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = ConfigFormat::Yaml)]
        format: ConfigFormat,
    },

    /// Reconcile a checkpoint against the architecture of a run configuration
    Reconcile {
        /// Path to the run configuration (JSON or YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint directory (e.g. checkpoints/epoch_12)
        #[arg(long)]
        checkpoint: PathBuf,

        /// Write the patched checkpoint, without optimizer state, to this directory
        #[arg(long)]
        write: Option<PathBuf>,
    },

    /// List the checkpoints of a checkpoint directory
    Checkpoints {
        /// Checkpoint root directory
        #[arg(short, long, default_value = "./checkpoints")]
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { config, format } => print_config(&config, format),
        Commands::Reconcile {
            config,
            checkpoint,
            write,
        } => reconcile_checkpoint(&config, &checkpoint, write.as_ref()),
        Commands::Checkpoints { dir } => list_checkpoints(&dir),
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<HifiGanConfig> {
    let config = HifiGanConfig::from_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config.validate().context("Invalid run configuration")?;
    Ok(config)
}

fn print_config(path: &PathBuf, format: ConfigFormat) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&config)?,
        ConfigFormat::Json => serde_json::to_string_pretty(&config)?,
    };
    println!("{}", rendered);
    Ok(())
}

fn reconcile_checkpoint(
    config_path: &PathBuf,
    checkpoint_path: &PathBuf,
    write: Option<&PathBuf>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let trainer = GanTrainer::new(&config).context("Failed to build models")?;

    let checkpoint = CheckpointManager::load_checkpoint(checkpoint_path)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint_path.display()))?;
    let metadata = checkpoint.metadata.clone();
    let resume = ResumeState::from_checkpoint(checkpoint, &trainer.model_state());

    println!("========================================");
    println!("  Checkpoint Reconciliation");
    println!("========================================");
    println!("Checkpoint:       {}", checkpoint_path.display());
    println!("Epoch:            {}", metadata.epoch);
    println!("Kept:             {}", resume.report.kept);
    println!("Shape mismatched: {}", resume.report.shape_mismatched.len());
    println!("Dropped:          {}", resume.report.dropped.len());
    println!("Missing:          {}", resume.report.missing.len());
    println!("Changed:          {}", resume.changed);
    println!("========================================");
    if !resume.report.is_clean() {
        println!("{}", serde_json::to_string_pretty(&resume.report)?);
    }

    if let Some(out) = write {
        let patched = CheckpointState {
            params: resume.params,
            optimizer_g: None,
            optimizer_d: None,
            metadata,
        };
        write_checkpoint_dir(out, &patched)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        println!("Patched checkpoint written to: {}", out.display());
    }
    Ok(())
}

fn list_checkpoints(dir: &PathBuf) -> anyhow::Result<()> {
    let manager = CheckpointManager::new(dir)?;
    let checkpoints = manager.list_checkpoints()?;
    if checkpoints.is_empty() {
        println!("No checkpoints in {}", dir.display());
        return Ok(());
    }

    for (epoch, path) in checkpoints {
        match CheckpointManager::load_checkpoint(&path) {
            Ok(state) => println!(
                "epoch {:>4}  step {:>8}  best {:<12}  {}",
                epoch,
                state.metadata.step,
                state
                    .metadata
                    .best_val_loss
                    .map(|v| format!("{:.4}", v))
                    .unwrap_or_else(|| "-".into()),
                state.metadata.timestamp
            ),
            Err(e) => println!("epoch {:>4}  unreadable: {}", epoch, e),
        }
    }
    Ok(())
}
