use std::fs;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;

use embedded_rfengine::engine::Engine;
use embedded_rfengine::resources::{ResourceIndex, SUFFIX_RAW_DATA};
use embedded_rfengine::rng::SeedPolicy;
use embedded_rfengine::store::{DirStore, ObjectStore, OpenMode};
use model_workbench::ingest::{write_model_artifacts, RawDataset};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Raw labelled CSV (label,v1,v2,...)
    #[arg(short = 'i', long = "input", value_name = "INPUT_FILE")]
    input: PathBuf,

    /// Directory backing the object store
    #[arg(short = 'r', long = "root", value_name = "STORE_DIR")]
    root: PathBuf,

    /// Model name (bounds the artifact paths)
    #[arg(short = 'm', long = "model")]
    model: String,

    /// Train deterministically with this seed; omitted means hardware entropy
    #[arg(short = 's', long = "seed")]
    seed: Option<u64>,

    /// Run a full training pass after ingesting
    #[arg(long = "train", default_value_t = false)]
    train: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    fs::create_dir_all(&args.root).context("could not create store root")?;
    let mut store = DirStore::new(&args.root);

    let raw = RawDataset::read(&args.input)?;
    let ctg = write_model_artifacts(&mut store, &args.model, &raw)?;

    // Keep the raw CSV next to the binary form.
    let rindex = ResourceIndex::new(&args.model)?;
    let raw_bytes = fs::read(&args.input)?;
    store
        .open(&rindex.path(SUFFIX_RAW_DATA)?, OpenMode::Write)?
        .write_all(&raw_bytes)?;

    println!(
        "Ingested {} samples, {} features, {} labels into model {:?}.",
        raw.rows.len(),
        raw.feature_count,
        ctg.num_labels(),
        args.model
    );

    if args.train {
        let policy = match args.seed {
            Some(seed) => SeedPolicy::Deterministic(seed),
            None => SeedPolicy::HardwareEntropy,
        };
        let mut engine = Engine::open(store, &args.model, policy)?;
        let score = engine.train()?;
        println!("Training finished. Best combined score: {score:.4}");
    }

    Ok(())
}
