//! circuit-prune CLI: optimal-ablation circuit discovery

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use circuit_prune::{
    kl_divergence, kl_loss, mask_to_circuit, mse_loss, select_device, AblationConstants, ArchitectureConfig,
    GraphDescriptor, HardConcreteSampler, MaskCheckpoint, MaskSampler, Pruner, PruningConfig,
    PruningMode, PruningOptimizer, ToyTransformer, VertexId, VertexPruner,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "circuit-prune")]
#[command(about = "Optimal-ablation circuit discovery for transformer components")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long, global = true)]
    cpu: bool,
}

/// Task loss comparing the pruned readout with the unpruned one
#[derive(Clone, Copy, Debug, ValueEnum)]
enum TaskLoss {
    Kl,
    Mse,
}

#[derive(Subcommand)]
enum Command {
    /// Print the vertex and edge counts of an architecture
    Describe {
        #[arg(long)]
        layers: usize,

        #[arg(long)]
        heads: usize,

        /// Attention-only model
        #[arg(long)]
        no_mlp: bool,
    },

    /// Threshold a saved mask into a circuit
    Extract {
        /// Checkpoint JSON written by `demo --save` or the library
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Keep elements strictly above this value (defaults to the checkpoint's)
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Circuit JSON output; printed to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Train a vertex mask on a toy model where only one head matters
    Demo {
        #[arg(long, default_value = "300")]
        steps: usize,

        /// Loss trained against
        #[arg(long, value_enum, default_value_t = TaskLoss::Kl)]
        loss: TaskLoss,

        /// Pruning hyperparameters as JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Save the trained checkpoint here
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Describe {
            layers,
            heads,
            no_mlp,
        } => describe(layers, heads, no_mlp),
        Command::Extract {
            checkpoint,
            threshold,
            output,
        } => extract(&checkpoint, threshold, output, cli.cpu),
        Command::Demo {
            steps,
            loss,
            config,
            save,
        } => demo(steps, loss, config, save, cli.cpu),
    }
}

fn describe(layers: usize, heads: usize, no_mlp: bool) -> Result<()> {
    let arch = if no_mlp {
        ArchitectureConfig::attention_only(layers, heads)
    } else {
        ArchitectureConfig::new(layers, heads)
    };
    let graph = GraphDescriptor::new(arch).context("Failed to build graph")?;

    println!("=== {} ===", graph.architecture());
    println!("Vertices:          {}", graph.n_vertices());
    println!("Maskable vertices: {}", graph.maskable_vertices().len());
    println!("Edges:             {}", graph.n_edges());
    Ok(())
}

fn extract(
    path: &Path,
    threshold: Option<f64>,
    output: Option<PathBuf>,
    cpu: bool,
) -> Result<()> {
    let device = select_device(cpu);
    let checkpoint = MaskCheckpoint::load(path)
        .with_context(|| format!("Failed to load checkpoint {}", path.display()))?;
    let graph = GraphDescriptor::new(checkpoint.architecture.clone())?;
    let sampler = checkpoint
        .build_sampler(&graph, &device)
        .context("Checkpoint does not match its architecture")?;

    let threshold = threshold.unwrap_or(checkpoint.config.threshold);
    let mask = sampler.resolve()?;
    let circuit = mask_to_circuit(&graph, checkpoint.mode, &mask, threshold, &BTreeSet::new())?;

    match output {
        Some(out) => circuit
            .save_json(&out)
            .with_context(|| format!("Failed to write {}", out.display()))?,
        None => println!("{}", serde_json::to_string_pretty(&circuit)?),
    }
    info!(
        "{} circuit of size {} at threshold {}",
        circuit.mode,
        circuit.size(),
        threshold
    );
    Ok(())
}

fn demo(
    steps: usize,
    loss: TaskLoss,
    config: Option<PathBuf>,
    save: Option<PathBuf>,
    cpu: bool,
) -> Result<()> {
    let device = select_device(cpu);
    let config = match config {
        Some(path) => PruningConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PruningConfig {
            lambda: 0.01,
            learn_temperature: false,
            ..Default::default()
        },
    };
    config.validate()?;

    let target = VertexId::attn(1, 0);
    let arch = ArchitectureConfig::new(2, 2);
    let d_model = 8;
    let model = ToyTransformer::random(arch.clone(), d_model, config.seed, &device)?.only(&[target]);
    let graph = Arc::new(GraphDescriptor::new(arch)?);

    println!("=== circuit-prune demo ===");
    println!("Model:  {} (only {target} active)", graph.architecture());
    println!("Steps:  {steps}");
    println!("Loss:   {loss:?}");

    let sampler = HardConcreteSampler::for_graph(&graph, PruningMode::Vertex, &config, &device)?;
    let mut constants = AblationConstants::zeros(&graph, PruningMode::Vertex, d_model, &device)?;
    constants.set_trainable(false);
    let mut pruner = VertexPruner::new(&model, graph.clone(), Box::new(sampler), constants)?;
    pruner.add_pruning_hooks()?;

    let mut optimizer = PruningOptimizer::new(&pruner, &config)?;
    for step in 0..steps {
        let batch = ToyTransformer::random_inputs(32, d_model, config.seed + step as u64, &device)?;
        let pruned = pruner.forward(&batch)?;
        let baseline = pruner.forward_unpruned(&batch)?;
        let task = match loss {
            TaskLoss::Kl => kl_loss(&pruned.output, &baseline)?,
            TaskLoss::Mse => mse_loss(&pruned.output, &baseline)?,
        };
        let report = optimizer.step(&mut pruner, &pruned, &task)?;
        if report.step % 50 == 0 {
            info!(
                "Step {:4}: loss {:.5} (task {:.5}, mask {:.5})",
                report.step,
                report.total(),
                report.task_loss,
                report.mask_loss
            );
        }
    }
    pruner.sampler_mut().freeze();

    println!("\n=== Resolved mask ===");
    let mask: Vec<f32> = pruner.sampler().resolve()?.to_vec1()?;
    for (vertex, value) in graph.maskable_vertices().iter().zip(&mask) {
        println!("{:>6}: {value:.3}", vertex.to_string());
    }

    let held_out_seed = config.seed.wrapping_add(1 << 32);
    let held_out = ToyTransformer::random_inputs(64, d_model, held_out_seed, &device)?;
    let pruned = pruner.forward(&held_out)?;
    let baseline = pruner.forward_unpruned(&held_out)?;
    println!(
        "Held-out KL: {:.5}",
        kl_divergence(&baseline, &pruned.output)?
    );

    if let Some(path) = save {
        MaskCheckpoint::capture(&pruner, &config)?
            .save(&path)
            .with_context(|| format!("Failed to save checkpoint {}", path.display()))?;
    }
    Ok(())
}
