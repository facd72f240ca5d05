use anyhow::Result;

use embedded_rfengine::dataset::{Dataset, Sample};
use embedded_rfengine::engine::Engine;
use embedded_rfengine::packed::PackedVec2;
use embedded_rfengine::rng::SeedPolicy;
use embedded_rfengine::store::{DirStore, ObjectStore, OpenMode};

pub const LABEL_NAMES: [&str; 3] = ["zero", "one", "two"];

pub fn temp_store() -> (tempfile::TempDir, DirStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = DirStore::new(dir.path());
    (dir, store)
}

pub fn packed(values: &[u8]) -> PackedVec2 {
    let mut v = PackedVec2::new();
    for &x in values {
        v.push_back(x);
    }
    v
}

/// Four discrete full-range features, `num_labels` named labels, no shared
/// patterns.
pub fn write_table(store: &mut DirStore, model: &str, num_labels: usize) -> Result<()> {
    use std::io::Write;
    let mut table = format!("CTG2,4,4,{num_labels},0,100\n");
    for (id, name) in LABEL_NAMES.iter().take(num_labels).enumerate() {
        table += &format!("L,{id},{name}\n");
    }
    for _ in 0..4 {
        table += "DF\n";
    }
    let mut f = store.open(&format!("/{model}_ctg.csv"), OpenMode::Write)?;
    f.write_all(table.as_bytes())?;
    Ok(())
}

pub fn write_dataset(store: &mut DirStore, model: &str, samples: &[(u8, [u8; 4])]) -> Result<()> {
    let mut ds = Dataset::init(&format!("/{model}_nml.bin"), 4)?;
    ds.begin_empty()?;
    for (label, values) in samples {
        ds.push_sample(&Sample {
            label: *label,
            features: packed(values),
        })?;
    }
    ds.release(store, false)?;
    Ok(())
}

/// Five all-zero samples labelled "zero" and five all-three samples
/// labelled "one".
pub fn tiny_model(store: &mut DirStore, model: &str) -> Result<()> {
    write_table(store, model, 2)?;
    let mut samples = Vec::new();
    for i in 0..10u8 {
        if i < 5 {
            samples.push((0, [0, 0, 0, 0]));
        } else {
            samples.push((1, [3, 3, 3, 3]));
        }
    }
    write_dataset(store, model, &samples)
}

/// Open the tiny model with a fixed training configuration.
pub fn open_tiny(store: DirStore, model: &str, seed: u64) -> Result<Engine<DirStore>> {
    let mut engine = Engine::open(store, model, SeedPolicy::Deterministic(seed))?;
    let cfg = engine.config_mut();
    cfg.num_trees = 3;
    cfg.min_split = 2;
    cfg.max_depth = 3;
    cfg.min_split_range = vec![2];
    cfg.max_depth_range = vec![3];
    cfg.enable_auto_config = false;
    cfg.unity_threshold = 0.66;
    Ok(engine)
}

pub fn read_bytes(store: &mut DirStore, path: &str) -> Vec<u8> {
    embedded_rfengine::store::read_all(store, path).expect("artifact readable")
}

pub fn assert_epsilon(left: f32, right: f32, epsilon: f32) {
    println!(
        "left: {left}, right: {right}, epsilon: {epsilon}, |left - right| = {}",
        (left - right).abs()
    );
    assert!((left - right).abs() <= epsilon.abs());
}
