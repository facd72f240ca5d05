use anyhow::Result;

use embedded_rfengine::engine::Engine;
use embedded_rfengine::rng::SeedPolicy;

use crate::helpers::{assert_epsilon, open_tiny, temp_store, tiny_model};

#[test]
fn tiny_classification_end_to_end() -> Result<()> {
    let (_dir, mut store) = temp_store();
    tiny_model(&mut store, "tiny")?;
    let mut engine = open_tiny(store, "tiny", 42)?;

    let score = engine.train()?;
    assert!(score > 0.7, "separable data should score high, got {score}");

    // Trees resolve to one split over the clean separation. A bootstrap bag
    // drawn single-class degenerates to a lone leaf, so bound rather than
    // pin the shape.
    let stats = engine.forest_stats()?;
    assert_eq!(stats.len(), 3);
    assert!(stats.iter().any(|t| t.nodes == 3 && t.depth == 2 && t.leaves == 2));
    for t in &stats {
        assert!(t.nodes <= 3, "tree {} grew past a single split", t.index);
    }

    assert_eq!(engine.predict(&[0.0, 0.0, 0.0, 0.0])?, Some("zero".to_string()));
    assert_eq!(engine.predict(&[3.0, 3.0, 3.0, 3.0])?, Some("one".to_string()));
    Ok(())
}

#[test]
fn training_is_deterministic_per_seed() -> Result<()> {
    let mut forest_files = Vec::new();
    let mut predictions = Vec::new();
    for _ in 0..2 {
        let (dir, mut store) = temp_store();
        tiny_model(&mut store, "det")?;
        let mut engine = open_tiny(store, "det", 42)?;
        engine.train()?;
        let mut probe = Vec::new();
        for x in 0..4u8 {
            let v = x as f32;
            probe.push(engine.predict(&[v, v, v, v])?);
        }
        predictions.push(probe);
        forest_files.push(read_from(&dir, "det_forest.bin"));
    }
    assert_eq!(
        forest_files[0], forest_files[1],
        "forest files must match byte for byte"
    );
    assert_eq!(predictions[0], predictions[1]);
    Ok(())
}

fn read_from(dir: &tempfile::TempDir, name: &str) -> Vec<u8> {
    std::fs::read(dir.path().join(name)).expect("artifact present")
}

#[test]
fn grid_search_recovers_from_a_bad_start() -> Result<()> {
    let (_dir, mut store) = temp_store();
    tiny_model(&mut store, "grid")?;
    let mut engine = Engine::open(store, "grid", SeedPolicy::Deterministic(42))?;
    {
        let cfg = engine.config_mut();
        cfg.num_trees = 3;
        // min_split 8 exceeds the 7-sample training subset, so the initial
        // forest is all leaves and scores poorly.
        cfg.min_split = 8;
        cfg.max_depth = 3;
        cfg.min_split_range = vec![2, 8];
        cfg.max_depth_range = vec![3];
        cfg.enable_auto_config = false;
        cfg.unity_threshold = 0.66;
    }
    let score = engine.train()?;
    assert_eq!(engine.config().min_split, 2, "sweep must adopt the better combo");
    assert_eq!(engine.config().max_depth, 3);
    assert_epsilon(score, 1.0, 0.25);

    assert_eq!(engine.predict(&[0.0; 4])?, Some("zero".to_string()));
    assert_eq!(engine.predict(&[3.0; 4])?, Some("one".to_string()));
    Ok(())
}

#[test]
fn tie_break_keeps_the_first_combination() -> Result<()> {
    let (_dir, mut store) = temp_store();
    tiny_model(&mut store, "tie")?;
    let mut engine = Engine::open(store, "tie", SeedPolicy::Deterministic(42))?;
    {
        let cfg = engine.config_mut();
        cfg.num_trees = 3;
        cfg.min_split = 2;
        cfg.max_depth = 3;
        // Both depths learn the single clean split identically.
        cfg.min_split_range = vec![2];
        cfg.max_depth_range = vec![3, 6];
        cfg.enable_auto_config = false;
        cfg.unity_threshold = 0.66;
    }
    engine.train()?;
    assert_eq!(engine.config().min_split, 2);
    assert_eq!(engine.config().max_depth, 3);
    Ok(())
}

#[test]
fn training_without_artifacts_is_refused() {
    let (_dir, store) = temp_store();
    let mut engine =
        Engine::open(store, "absent", SeedPolicy::Deterministic(1)).expect("open is lazy");
    assert!(matches!(
        engine.train(),
        Err(embedded_rfengine::Error::NotReady)
    ));
}

#[test]
fn node_predictor_learns_from_training_runs() -> Result<()> {
    let (_dir, mut store) = temp_store();
    tiny_model(&mut store, "npred")?;
    let mut engine = open_tiny(store, "npred", 9)?;
    engine.train()?;

    assert!(engine.predictor().trained());
    assert!(engine.predictor().accuracy() <= 100);
    assert!(engine
        .resources()
        .has(embedded_rfengine::resources::Artifacts::NODE_PREDICTOR));
    // The estimate now pre-sizes buffers somewhere sane.
    let est = engine.predictor().estimate(2, 3);
    assert!((10..=2047).contains(&est));
    Ok(())
}

#[test]
fn retrain_toggle_is_honoured() -> Result<()> {
    let (_dir, mut store) = temp_store();
    tiny_model(&mut store, "noretrain")?;
    let mut engine = open_tiny(store, "noretrain", 9)?;
    engine.config_mut().enable_retrain = false;
    engine.train()?;
    assert!(!engine.predictor().trained());
    assert!(!engine
        .resources()
        .has(embedded_rfengine::resources::Artifacts::NODE_PREDICTOR));
    Ok(())
}

#[test]
fn validation_split_contributes_to_the_score() -> Result<()> {
    let (_dir, mut store) = temp_store();
    // 30 samples so every split has a few members.
    crate::helpers::write_table(&mut store, "valid", 2)?;
    let mut samples = Vec::new();
    for i in 0..30u8 {
        if i % 2 == 0 {
            samples.push((0, [0, 0, 1, 0]));
        } else {
            samples.push((1, [3, 3, 2, 3]));
        }
    }
    crate::helpers::write_dataset(&mut store, "valid", &samples)?;
    let mut engine = Engine::open(store, "valid", SeedPolicy::Deterministic(5))?;
    {
        let cfg = engine.config_mut();
        cfg.num_trees = 5;
        cfg.min_split = 2;
        cfg.max_depth = 4;
        cfg.min_split_range = vec![2];
        cfg.max_depth_range = vec![4];
        cfg.enable_auto_config = false;
        cfg.train_ratio = 0.6;
        cfg.test_ratio = 0.2;
        cfg.valid_ratio = 0.2;
        cfg.training_score = embedded_rfengine::config::TrainingScore::Valid;
    }
    let score = engine.train()?;
    assert!(score > 0.8, "separable data with validation, got {score}");
    Ok(())
}

#[test]
fn kfold_scoring_trains_successfully() -> Result<()> {
    let (_dir, mut store) = temp_store();
    crate::helpers::write_table(&mut store, "kfold", 2)?;
    let mut samples = Vec::new();
    for i in 0..40u8 {
        if i % 2 == 0 {
            samples.push((0, [0, 1, 0, 0]));
        } else {
            samples.push((1, [3, 2, 3, 3]));
        }
    }
    crate::helpers::write_dataset(&mut store, "kfold", &samples)?;
    let mut engine = Engine::open(store, "kfold", SeedPolicy::Deterministic(8))?;
    {
        let cfg = engine.config_mut();
        cfg.num_trees = 3;
        cfg.min_split = 2;
        cfg.max_depth = 4;
        cfg.min_split_range = vec![2];
        cfg.max_depth_range = vec![4];
        cfg.enable_auto_config = false;
        cfg.k_fold = 4;
        cfg.training_score = embedded_rfengine::config::TrainingScore::KFold;
    }
    let score = engine.train()?;
    assert!(score > 0.8, "k-fold over separable data, got {score}");
    Ok(())
}
