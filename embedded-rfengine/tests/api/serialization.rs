use anyhow::Result;

use embedded_rfengine::engine::Engine;
use embedded_rfengine::rng::SeedPolicy;
use embedded_rfengine::store::DirStore;

use crate::helpers::{open_tiny, read_bytes, temp_store, tiny_model};

#[test]
fn unified_forest_round_trips_through_reopen() -> Result<()> {
    let (dir, mut store) = temp_store();
    tiny_model(&mut store, "ser")?;
    let mut engine = open_tiny(store, "ser", 42)?;
    engine.train()?;
    let stats_before = engine.forest_stats()?;
    drop(engine);

    // Fresh engine over the same store: the forest must come back intact.
    let store = DirStore::new(dir.path());
    let mut engine = Engine::open(store, "ser", SeedPolicy::Deterministic(42))?;
    let stats_after = engine.forest_stats()?;
    assert_eq!(stats_before.len(), stats_after.len());
    for (a, b) in stats_before.iter().zip(&stats_after) {
        assert_eq!(a.index, b.index);
        assert_eq!(a.nodes, b.nodes);
        assert_eq!(a.leaves, b.leaves);
        assert_eq!(a.depth, b.depth);
    }
    assert_eq!(engine.predict(&[0.0; 4])?, Some("zero".to_string()));
    Ok(())
}

#[test]
fn forest_magic_bytes_little_endian() -> Result<()> {
    let (dir, mut store) = temp_store();
    tiny_model(&mut store, "magic2")?;
    let mut engine = open_tiny(store, "magic2", 42)?;
    engine.train()?;
    drop(engine);
    let bytes = std::fs::read(dir.path().join("magic2_forest.bin"))?;
    assert_eq!(&bytes[..4], &[0x53, 0x52, 0x4F, 0x46], "\"FORS\" stored little-endian");
    assert_eq!(bytes[4], 3, "tree count header");
    Ok(())
}

#[test]
fn config_preserves_foreign_fields_across_training() -> Result<()> {
    let (dir, mut store) = temp_store();
    tiny_model(&mut store, "cfg")?;
    // Seed a config carrying fields the engine does not interpret.
    std::fs::write(
        dir.path().join("cfg_config.json"),
        serde_json::to_string_pretty(&serde_json::json!({
            "num_trees": 3, "min_split": 2, "max_depth": 3,
            "use_bootstrap": true, "bootstrap_ratio": 0.66, "use_gini": true,
            "k_fold": 5, "unity_threshold": 0.66, "impurity_threshold": 0.01,
            "train_ratio": 0.7, "test_ratio": 0.3, "valid_ratio": 0.0,
            "combine_ratio": 0.5, "metric_score": 1, "training_score": "oob",
            "min_split_range": [2], "max_depth_range": [3],
            "num_samples": 0, "num_features": 0, "num_labels": 0,
            "samples_per_label": [], "estimated_ram": 16384,
            "extend_base_data": true, "enable_retrain": true,
            "enable_auto_config": false,
            "timestamp": "2024-06-01T08:00:00Z", "author": "field team"
        }))?,
    )?;
    let mut engine = Engine::open(store, "cfg", SeedPolicy::Deterministic(3))?;
    engine.train()?;
    drop(engine);

    let back: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("cfg_config.json"))?)?;
    assert_eq!(back["timestamp"], "2024-06-01T08:00:00Z");
    assert_eq!(back["author"], "field team");
    // And the engine's own bookkeeping was refreshed.
    assert_eq!(back["num_samples"], 10);
    assert_eq!(back["num_features"], 4);
    Ok(())
}

#[test]
fn split_artifacts_are_purged_after_training() -> Result<()> {
    let (dir, mut store) = temp_store();
    tiny_model(&mut store, "clean")?;
    let mut engine = open_tiny(store, "clean", 42)?;
    engine.train()?;
    drop(engine);
    for transient in ["clean_train.bin", "clean_test.bin", "clean_valid.bin"] {
        assert!(
            !dir.path().join(transient).exists(),
            "{transient} left behind"
        );
    }
    // The persistent family is all present.
    for artifact in [
        "clean_nml.bin",
        "clean_ctg.csv",
        "clean_dp.csv",
        "clean_config.json",
        "clean_forest.bin",
        "clean_node_pred.bin",
        "clean_node_log.csv",
    ] {
        assert!(dir.path().join(artifact).exists(), "{artifact} missing");
    }
    Ok(())
}

#[test]
fn rename_cascades_and_preserves_bytes() -> Result<()> {
    let (dir, mut store) = temp_store();
    tiny_model(&mut store, "oldname")?;
    let mut engine = open_tiny(store, "oldname", 42)?;
    engine.train()?;

    let artifacts = [
        "_nml.bin",
        "_ctg.csv",
        "_dp.csv",
        "_config.json",
        "_forest.bin",
        "_node_pred.bin",
        "_node_log.csv",
    ];
    let mut before = Vec::new();
    for suffix in artifacts {
        before.push(std::fs::read(dir.path().join(format!("oldname{suffix}")))?);
    }

    engine.rename("newname")?;
    drop(engine);

    for (suffix, want) in artifacts.iter().zip(&before) {
        let old = dir.path().join(format!("oldname{suffix}"));
        let new = dir.path().join(format!("newname{suffix}"));
        assert!(!old.exists(), "old artifact {suffix} still present");
        let got = std::fs::read(&new)?;
        assert_eq!(&got, want, "bytes changed across rename for {suffix}");
    }

    // The renamed model serves predictions as before.
    let store = DirStore::new(dir.path());
    let mut engine = Engine::open(store, "newname", SeedPolicy::Deterministic(42))?;
    assert_eq!(engine.predict(&[3.0; 4])?, Some("one".to_string()));
    Ok(())
}

#[test]
fn read_bytes_helper_sees_engine_artifacts() -> Result<()> {
    let (_dir, mut store) = temp_store();
    tiny_model(&mut store, "bytes")?;
    let nml = read_bytes(&mut store, "/bytes_nml.bin");
    assert_eq!(&nml[..4], &10u32.to_le_bytes());
    assert_eq!(&nml[4..6], &4u16.to_le_bytes());
    Ok(())
}
