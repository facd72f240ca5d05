use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;

use embedded_rfengine::engine::Engine;
use embedded_rfengine::resources::Artifacts;
use embedded_rfengine::rng::SeedPolicy;
use embedded_rfengine::store::DirStore;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory backing the object store
    #[arg(short = 'r', long = "root", value_name = "STORE_DIR")]
    root: PathBuf,

    /// Model name
    #[arg(short = 'm', long = "model")]
    model: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    let store = DirStore::new(&args.root);
    let mut engine = Engine::open(store, &args.model, SeedPolicy::Deterministic(0))?;

    let flags = engine.resources().flags();
    println!("--- Model {:?} ---", args.model);
    println!(
        "Artifacts: base={} csv={} categorizer={} dp={} config={} forest={} trees={} predictor={} log={}",
        flags.contains(Artifacts::BASE_DATA_BIN),
        flags.contains(Artifacts::BASE_DATA_CSV),
        flags.contains(Artifacts::CATEGORIZER),
        flags.contains(Artifacts::DATA_PARAMS),
        flags.contains(Artifacts::CONFIG),
        flags.contains(Artifacts::UNIFIED_FOREST),
        flags.contains(Artifacts::PER_TREE),
        flags.contains(Artifacts::NODE_PREDICTOR),
        flags.contains(Artifacts::INFER_LOG),
    );
    println!(
        "Ready: training={} inference={}",
        engine.resources().ready_for_training(),
        engine.resources().ready_for_inference()
    );

    let cfg = engine.config();
    println!(
        "\n--- Configuration ---\n{} trees | min_split {} | max_depth {} | gini {} | bootstrap {} ({:.2})",
        cfg.num_trees, cfg.min_split, cfg.max_depth, cfg.use_gini, cfg.use_bootstrap, cfg.bootstrap_ratio
    );
    println!(
        "Data: {} samples x {} features, {} labels | per label {:?}",
        cfg.num_samples, cfg.num_features, cfg.num_labels, cfg.samples_per_label
    );
    println!(
        "Split: train {:.2} / test {:.2} / valid {:.2} | unity {:.2} | estimated RAM {} bytes",
        cfg.train_ratio, cfg.test_ratio, cfg.valid_ratio, cfg.unity_threshold, cfg.estimated_ram
    );

    let predictor = engine.predictor();
    if predictor.trained() {
        let [b0, b1, b2] = predictor.coeffs();
        println!(
            "\n--- Node predictor ---\naccuracy {}% | peak {}% | nodes = {b0:.1} + {b1:.2}*min_split + {b2:.2}*max_depth",
            predictor.accuracy(),
            predictor.peak_percent()
        );
    } else {
        println!("\n--- Node predictor ---\nuntrained (heuristic estimates)");
    }

    if engine.resources().ready_for_inference() {
        let stats = engine.forest_stats()?;
        let total_nodes: u32 = stats.iter().map(|t| t.nodes as u32).sum();
        println!(
            "\n--- Forest ---\n{} trees | {} nodes | {} bytes serialized",
            stats.len(),
            total_nodes,
            total_nodes * 4 + 5 + stats.len() as u32 * 5
        );
        for t in &stats {
            println!(
                "\t{}: {} nodes, {} leaves, depth {}",
                t.index, t.nodes, t.leaves, t.depth
            );
        }
    } else {
        println!("\n--- Forest ---\nnot available");
    }

    if flags.contains(Artifacts::INFER_LOG) {
        let (count, agreement) = engine.infer_log_summary()?;
        println!(
            "\n--- Inference log ---\n{count} predictions | {:.1}% agreement with feedback",
            agreement * 100.0
        );
    }

    Ok(())
}
