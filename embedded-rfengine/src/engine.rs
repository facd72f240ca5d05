//! Host-facing engine surface.
//!
//! One `Engine` instance owns everything for one model name: the object
//! store, the resource index, the configuration, the categorizer, the node
//! predictor, the base dataset, the forest, and the pending-feedback buffer.
//! Components never outlive the engine and nothing reads global state; the
//! seed policy is passed once at `open`.
//!
//! Training: partition the base dataset into train/test/(validation) subset
//! files, build and score an initial forest, sweep the grid, persist the
//! winner, feed the node-count log, and optionally retrain the node
//! predictor. Prediction: categorize, vote, queue the result for feedback.

use crate::categorizer::Categorizer;
use crate::config::{Config, TrainingScore};
use crate::dataset::{Dataset, Sample};
use crate::feedback::{self, PendingFeedback, SystemClock, TimeSource};
use crate::forest::Forest;
use crate::grid::{self, TrainSession};
use crate::predictor::{LogRow, NodePredictor};
use crate::resources::{
    Artifacts, ResourceIndex, SUFFIX_BASE_DATA, SUFFIX_CATEGORIZER, SUFFIX_CONFIG,
    SUFFIX_DATA_PARAMS, SUFFIX_FOREST, SUFFIX_INFER_LOG, SUFFIX_NODE_LOG, SUFFIX_NODE_PREDICTOR,
};
use crate::rng::{Prng, SeedPolicy};
use crate::score::{combined_score, Scorer};
use crate::store::{HeapMonitor, ObjectStore};
use crate::tree::builder::{BuildParams, TreeBuilder};
use crate::tree::io as tree_io;
use crate::{Error, Result, LABEL_UNKNOWN, MAX_TREES};

/// Transient split artifacts; purged at the end of every training run.
const SUFFIX_SPLIT_TRAIN: &str = "_train.bin";
const SUFFIX_SPLIT_TEST: &str = "_test.bin";
const SUFFIX_SPLIT_VALID: &str = "_valid.bin";

/// Sub-stream ids reserved next to the per-tree streams (0..MAX_TREES).
const SPLIT_STREAM: u32 = 1_000;
const KFOLD_STREAM: u32 = 2_000;

/// Per-tree traversal statistics for inspection surfaces.
#[derive(Debug, Clone, Copy)]
pub struct TreeStats {
    pub index: u8,
    pub nodes: u16,
    pub leaves: u16,
    pub depth: u8,
}

pub struct Engine<S: ObjectStore + HeapMonitor, C: TimeSource = SystemClock> {
    store: S,
    clock: C,
    rng: Prng,
    resources: ResourceIndex,
    config: Config,
    categorizer: Option<Categorizer>,
    predictor: NodePredictor,
    base: Dataset,
    forest: Forest,
    pending: PendingFeedback,
}

impl<S: ObjectStore + HeapMonitor> Engine<S, SystemClock> {
    pub fn open(store: S, model: &str, seed_policy: SeedPolicy) -> Result<Self> {
        Self::open_with_clock(store, SystemClock, model, seed_policy)
    }
}

impl<S: ObjectStore + HeapMonitor, C: TimeSource> Engine<S, C> {
    pub fn open_with_clock(
        mut store: S,
        clock: C,
        model: &str,
        seed_policy: SeedPolicy,
    ) -> Result<Self> {
        let mut resources = ResourceIndex::new(model)?;
        resources.scan(&store)?;

        let mut config = if resources.has(Artifacts::CONFIG) {
            Config::load_json(&mut store, &resources.path(SUFFIX_CONFIG)?)?
        } else {
            Config::default()
        };
        if resources.has(Artifacts::DATA_PARAMS) {
            config.load_data_params(&mut store, &resources.path(SUFFIX_DATA_PARAMS)?)?;
        }
        if resources.has(Artifacts::BASE_DATA_BIN) {
            let (n, nf) =
                Dataset::peek_header(&mut store, &resources.path(SUFFIX_BASE_DATA)?)?;
            if resources.has(Artifacts::DATA_PARAMS)
                && (config.num_features != nf || config.num_samples != n)
            {
                return Err(Error::MalformedTable);
            }
            config.num_features = nf;
            config.num_samples = n;
        }
        config.normalize_ratios();
        config.validate()?;

        let categorizer = if resources.has(Artifacts::CATEGORIZER) {
            let ctg = Categorizer::load(&mut store, &resources.path(SUFFIX_CATEGORIZER)?)?;
            if config.num_features != 0 && ctg.num_features() != config.num_features {
                return Err(Error::MalformedTable);
            }
            Some(ctg)
        } else {
            None
        };
        let predictor = if resources.has(Artifacts::NODE_PREDICTOR) {
            NodePredictor::load(&mut store, &resources.path(SUFFIX_NODE_PREDICTOR)?)?
        } else {
            NodePredictor::default()
        };
        let base = Dataset::init(&resources.path(SUFFIX_BASE_DATA)?, config.num_features)?;

        Ok(Engine {
            store,
            clock,
            rng: Prng::from_policy(seed_policy),
            resources,
            config,
            categorizer,
            predictor,
            base,
            forest: Forest::new(),
            pending: PendingFeedback::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn resources(&self) -> &ResourceIndex {
        &self.resources
    }

    pub fn predictor(&self) -> &NodePredictor {
        &self.predictor
    }

    pub fn categorizer(&self) -> Option<&Categorizer> {
        self.categorizer.as_ref()
    }

    /// Full training pass: split, initial forest, grid sweep, persistence,
    /// bookkeeping. Returns the best combined score.
    pub fn train(&mut self) -> Result<f32> {
        if !self.resources.ready_for_training() {
            return Err(Error::NotReady);
        }
        self.base.load(&mut self.store)?;
        self.config.scan_dataset(&self.base);
        if let Some(ctg) = &self.categorizer {
            self.config.num_labels = self.config.num_labels.max(ctg.num_labels());
        }
        if self.config.samples_per_label.len() < self.config.num_labels as usize {
            self.config
                .samples_per_label
                .resize(self.config.num_labels as usize, 0);
        }
        if self.config.enable_auto_config {
            self.config.auto_configure();
        }
        self.config.normalize_ratios();
        self.config.validate()?;

        let n = self.base.num_samples() as usize;
        if n < 2 {
            self.base.release(&mut self.store, true)?;
            return Err(Error::NotReady);
        }

        // Random partition into train/test/(validation) id sets; subset
        // loading wants each set ascending.
        let mut ids: Vec<u16> = (0..n as u16).collect();
        let mut split_rng = self.rng.derive(SPLIT_STREAM, 0);
        for i in 0..n {
            let j = i + split_rng.bounded((n - i) as u32) as usize;
            ids.swap(i, j);
        }
        let n_train = ((n as f32 * self.config.train_ratio) as usize).clamp(1, n);
        let with_valid = self.config.valid_ratio > 0.0;
        let n_test = if with_valid {
            ((n as f32 * self.config.test_ratio) as usize).min(n - n_train)
        } else {
            n - n_train
        };
        let mut train_ids = ids[..n_train].to_vec();
        let mut test_ids = ids[n_train..n_train + n_test].to_vec();
        let mut valid_ids = ids[n_train + n_test..].to_vec();
        train_ids.sort_unstable();
        test_ids.sort_unstable();
        valid_ids.sort_unstable();

        let nf = self.config.num_features;
        let mut train_data = Dataset::init(&self.resources.path(SUFFIX_SPLIT_TRAIN)?, nf)?;
        train_data.load_subset(&mut self.store, &mut self.base, &train_ids, false)?;
        train_data.release(&mut self.store, false)?;
        let mut test_data = Dataset::init(&self.resources.path(SUFFIX_SPLIT_TEST)?, nf)?;
        if !test_ids.is_empty() {
            test_data.load_subset(&mut self.store, &mut self.base, &test_ids, false)?;
            test_data.release(&mut self.store, false)?;
        }
        let mut valid_data = if with_valid && !valid_ids.is_empty() {
            let mut d = Dataset::init(&self.resources.path(SUFFIX_SPLIT_VALID)?, nf)?;
            d.load_subset(&mut self.store, &mut self.base, &valid_ids, false)?;
            d.release(&mut self.store, false)?;
            d.load(&mut self.store)?;
            Some(d)
        } else {
            None
        };
        self.base.release(&mut self.store, true)?;
        train_data.load(&mut self.store)?;

        let node_log_path = self.resources.path(SUFFIX_NODE_LOG)?;
        let forest_path = self.resources.path(SUFFIX_FOREST)?;
        let (outcome, persisted_nodes) = {
            let mut ctx = TrainCtx {
                store: &mut self.store,
                cfg: &mut self.config,
                rng: &self.rng,
                predictor: &self.predictor,
                train: &train_data,
                valid: valid_data.as_ref(),
                forest: &mut self.forest,
                bags: Vec::new(),
                node_log_path: node_log_path.as_str(),
                forest_path: forest_path.as_str(),
                persisted_nodes: 0,
            };
            ctx.make_forest()?;
            let initial = ctx.evaluate()?;
            ctx.persist()?;
            let ms_range = ctx.cfg.min_split_range.clone();
            let md_range = ctx.cfg.max_depth_range.clone();
            let (ms0, md0) = (ctx.cfg.min_split, ctx.cfg.max_depth);
            let outcome = grid::search(&mut ctx, &ms_range, &md_range, initial, ms0, md0)?;
            (outcome, ctx.persisted_nodes)
        };
        // The in-RAM forest belongs to the last combination tried, not
        // necessarily the winner; the winner is on the store.
        self.forest.clear();

        self.config.min_split = outcome.best_min_split;
        self.config.max_depth = outcome.best_max_depth;
        self.config.estimated_ram = persisted_nodes * 4 + 8192;
        self.resources.mark(Artifacts::UNIFIED_FOREST);

        if self.config.enable_retrain {
            self.predictor.retrain(&mut self.store, &node_log_path)?;
            self.predictor
                .release(&mut self.store, &self.resources.path(SUFFIX_NODE_PREDICTOR)?)?;
            self.resources.mark(Artifacts::NODE_PREDICTOR);
        }
        self.config
            .save_json(&mut self.store, &self.resources.path(SUFFIX_CONFIG)?)?;
        self.resources.mark(Artifacts::CONFIG);
        self.config
            .save_data_params(&mut self.store, &self.resources.path(SUFFIX_DATA_PARAMS)?)?;
        self.resources.mark(Artifacts::DATA_PARAMS);

        train_data.purge(&mut self.store);
        test_data.purge(&mut self.store);
        if let Some(v) = valid_data.as_mut() {
            v.purge(&mut self.store);
        }
        log::debug!(
            "train: best score {:.4} at ({}, {})",
            outcome.best_score,
            outcome.best_min_split,
            outcome.best_max_depth
        );
        Ok(outcome.best_score)
    }

    fn ensure_forest(&mut self) -> Result<()> {
        if self.forest.is_loaded() {
            return Ok(());
        }
        if !self.resources.ready_for_inference() {
            return Err(Error::NotReady);
        }
        let loaded = self.forest.load(
            &mut self.store,
            &self.resources,
            self.config.num_trees,
            self.config.estimated_ram,
        )?;
        if loaded == 0 {
            log::warn!("forest: no trees loadable");
        }
        Ok(())
    }

    /// Classify one real-valued feature vector. `None` means the ensemble
    /// abstained (certainty below threshold, or no usable trees); errors are
    /// reserved for missing artifacts and storage failures.
    pub fn predict(&mut self, features: &[f32]) -> Result<Option<String>> {
        if self.categorizer.is_none() {
            return Err(Error::NotReady);
        }
        self.ensure_forest()?;
        let (packed, predicted, name) = {
            let ctg = self.categorizer.as_ref().ok_or(Error::NotReady)?;
            let packed = ctg.categorize_sample(features);
            let predicted = self
                .forest
                .predict_packed(&packed, self.config.unity_threshold);
            let name = if predicted == LABEL_UNKNOWN {
                None
            } else {
                ctg.original_label(predicted).map(str::to_string)
            };
            (packed, predicted, name)
        };
        self.pending.record_prediction(Sample {
            label: predicted,
            features: packed,
        });
        if self.pending.is_full() {
            self.flush_pending()?;
        }
        Ok(name)
    }

    /// Supply ground truth for the oldest unanswered prediction, by original
    /// label name.
    pub fn record_actual(&mut self, label: &str) -> Result<()> {
        let ctg = self.categorizer.as_ref().ok_or(Error::NotReady)?;
        let id = ctg.normalized_label(label);
        let now = self.clock.now_ms();
        self.pending.record_actual(id, now);
        Ok(())
    }

    /// Flush answered feedback into the base dataset and the inference log.
    pub fn flush_pending(&mut self) -> Result<()> {
        if self.pending.pending() == 0 {
            return Ok(());
        }
        if self.pending.answered() > 0 && !self.resources.has(Artifacts::BASE_DATA_BIN) {
            return Err(Error::NotReady);
        }
        let log_path = self.resources.path(SUFFIX_INFER_LOG)?;
        self.pending
            .flush(&mut self.store, &mut self.base, &mut self.config, &log_path)?;
        self.resources.mark(Artifacts::INFER_LOG);

        // Keep the persisted statistics in step; both writes are best-effort.
        if let Err(e) = self
            .config
            .save_json(&mut self.store, &self.resources.path(SUFFIX_CONFIG)?)
        {
            log::warn!("config rewrite after flush failed: {e}");
        } else {
            self.resources.mark(Artifacts::CONFIG);
        }
        if let Err(e) = self
            .config
            .save_data_params(&mut self.store, &self.resources.path(SUFFIX_DATA_PARAMS)?)
        {
            log::warn!("data-params rewrite after flush failed: {e}");
        } else {
            self.resources.mark(Artifacts::DATA_PARAMS);
        }
        Ok(())
    }

    /// Rename every artifact of this model; the engine keeps serving under
    /// the new name.
    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        self.resources.rename(&mut self.store, new_name)?;
        let base_path = self.resources.path(SUFFIX_BASE_DATA)?;
        self.base.set_path(&base_path)?;
        Ok(())
    }

    /// Traversal statistics for every loaded tree (loads the forest on
    /// demand).
    pub fn forest_stats(&mut self) -> Result<Vec<TreeStats>> {
        self.ensure_forest()?;
        Ok(self
            .forest
            .trees()
            .iter()
            .map(|t| TreeStats {
                index: t.index,
                nodes: t.node_count() as u16,
                leaves: t.leaf_count() as u16,
                depth: t.depth(),
            })
            .collect())
    }

    /// (entry count, agreement rate) of the inference log.
    pub fn infer_log_summary(&mut self) -> Result<(u32, f32)> {
        let path = self.resources.path(SUFFIX_INFER_LOG)?;
        feedback::summarize_infer_log(&mut self.store, &path)
    }
}

/// One training attempt's worth of borrowed engine state; the seam the grid
/// search drives.
struct TrainCtx<'a, S: ObjectStore + HeapMonitor> {
    store: &'a mut S,
    cfg: &'a mut Config,
    rng: &'a Prng,
    predictor: &'a NodePredictor,
    train: &'a Dataset,
    valid: Option<&'a Dataset>,
    forest: &'a mut Forest,
    bags: Vec<Vec<u16>>,
    node_log_path: &'a str,
    forest_path: &'a str,
    persisted_nodes: u32,
}

impl<S: ObjectStore + HeapMonitor> TrainCtx<'_, S> {
    fn oob_score(&self) -> f32 {
        let mut scorer = Scorer::new(self.cfg.num_labels.max(1));
        for i in 0..self.train.num_samples() as usize {
            let x = self.train.features_of(i);
            let p = self
                .forest
                .oob_predict(&x, i as u16, &self.bags, self.cfg.unity_threshold);
            scorer.record(p, self.train.get_label(i));
        }
        scorer.metric_mean(self.cfg.metric_mask())
    }

    fn holdout_score(&self, data: &Dataset) -> f32 {
        let mut scorer = Scorer::new(self.cfg.num_labels.max(1));
        for i in 0..data.num_samples() as usize {
            let x = data.features_of(i);
            let p = self.forest.predict_packed(&x, self.cfg.unity_threshold);
            scorer.record(p, data.get_label(i));
        }
        scorer.metric_mean(self.cfg.metric_mask())
    }

    /// K-fold cross-validation over the training subset. Fold forests use
    /// reserved sub-streams so they never correlate with the main ensemble.
    fn kfold_score(&mut self) -> Result<f32> {
        let n = self.train.num_samples() as usize;
        let k = self.cfg.k_fold.max(2) as usize;
        if n < 2 * k {
            return Ok(self.oob_score());
        }
        let num_labels = self.cfg.num_labels.max(1);
        let params = BuildParams {
            min_split: self.cfg.min_split,
            max_depth: self.cfg.max_depth,
            use_gini: self.cfg.use_gini,
            impurity_threshold: self.cfg.impurity_threshold,
            num_labels,
        };
        let node_hint = self.predictor.estimate(self.cfg.min_split, self.cfg.max_depth);
        let queue_hint = self.predictor.queue_peak(self.cfg.min_split, self.cfg.max_depth);

        let mut ids: Vec<u16> = (0..n as u16).collect();
        let mut fold_rng = self.rng.derive(KFOLD_STREAM, 0);
        for i in 0..n {
            let j = i + fold_rng.bounded((n - i) as u32) as usize;
            ids.swap(i, j);
        }

        let mut sum = 0.0f32;
        for fold in 0..k {
            let lo = fold * n / k;
            let hi = (fold + 1) * n / k;
            let held_out = &ids[lo..hi];
            let pool: Vec<u16> = ids[..lo].iter().chain(&ids[hi..]).copied().collect();

            let mut trees = Vec::new();
            for t in 0..self.cfg.num_trees as u32 {
                let stream_id = KFOLD_STREAM + 1 + fold as u32 * MAX_TREES as u32 + t;
                let mut stream = self.rng.derive(stream_id, 0);
                let bag: Vec<u16> = (0..pool.len())
                    .map(|_| pool[stream.bounded(pool.len() as u32) as usize])
                    .collect();
                let tree = TreeBuilder::new(self.train, params, stream, &*self.store)
                    .build(t as u8, bag, node_hint, queue_hint);
                if tree.node_count() > 0 {
                    trees.push(tree);
                }
            }
            let fold_forest = Forest::from_trees(trees);
            let mut scorer = Scorer::new(num_labels);
            for &i in held_out {
                let x = self.train.features_of(i as usize);
                let p = fold_forest.predict_packed(&x, self.cfg.unity_threshold);
                scorer.record(p, self.train.get_label(i as usize));
            }
            sum += scorer.metric_mean(self.cfg.metric_mask());
        }
        Ok(sum / k as f32)
    }
}

impl<S: ObjectStore + HeapMonitor> TrainSession for TrainCtx<'_, S> {
    fn set_combo(&mut self, min_split: u16, max_depth: u8) {
        self.cfg.min_split = min_split;
        self.cfg.max_depth = max_depth;
    }

    fn make_forest(&mut self) -> Result<()> {
        self.bags = self
            .forest
            .make(self.train, self.cfg, self.rng, self.predictor, &*self.store)?;
        if self.forest.num_trees() > 0 {
            let per_tree = (self.forest.total_nodes() / self.forest.num_trees()) as u16;
            let row = LogRow {
                min_split: self.cfg.min_split,
                max_depth: self.cfg.max_depth,
                total_nodes: per_tree,
            };
            if let Err(e) = NodePredictor::append_observation(self.store, self.node_log_path, row)
            {
                log::warn!("node log append failed: {e}");
            }
        }
        Ok(())
    }

    fn evaluate(&mut self) -> Result<f32> {
        match self.cfg.training_score {
            TrainingScore::Oob => Ok(self.oob_score()),
            TrainingScore::Valid => {
                let oob = self.oob_score();
                let valid = self.valid.map(|v| self.holdout_score(v));
                Ok(combined_score(oob, valid, self.cfg.combine_ratio))
            }
            TrainingScore::KFold => self.kfold_score(),
        }
    }

    fn persist(&mut self) -> Result<()> {
        tree_io::write_forest(self.store, self.forest_path, self.forest.trees())?;
        self.persisted_nodes = self.forest.total_nodes() as u32;
        Ok(())
    }
}
