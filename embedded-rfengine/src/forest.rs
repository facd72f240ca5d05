//! Ensemble construction and majority voting.
//!
//! Each tree draws its bag from a per-tree derived PRNG stream: either a
//! bootstrap sample of the full training size (with replacement) or a
//! Fisher-Yates subsample of `bootstrap_ratio`. Bags are hashed and a
//! colliding bag is re-drawn with a bumped nonce so no two trees are
//! identical. Voting commits to the majority label only when its share of
//! the cast votes reaches the certainty threshold; otherwise the ensemble
//! abstains with 255.

use heapless::LinearMap;

use crate::config::Config;
use crate::dataset::Dataset;
use crate::packed::PackedVec2;
use crate::predictor::NodePredictor;
use crate::resources::{ResourceIndex, SUFFIX_FOREST};
use crate::rng::Prng;
use crate::store::{HeapMonitor, ObjectStore};
use crate::tree::builder::{BuildParams, TreeBuilder};
use crate::tree::{io, Tree};
use crate::{Error, Result, LABEL_UNKNOWN, MAX_TREES};

/// Give up re-drawing a colliding bag after this many nonce bumps; tiny
/// datasets can make distinct bags impossible.
const MAX_BAG_REDRAWS: u32 = 8;

#[derive(Debug, Default)]
pub struct Forest {
    trees: Vec<Tree>,
    unified: bool,
}

impl Forest {
    pub fn new() -> Self {
        Forest::default()
    }

    pub fn from_trees(trees: Vec<Tree>) -> Self {
        Forest {
            trees,
            unified: false,
        }
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn unified(&self) -> bool {
        self.unified
    }

    pub fn is_loaded(&self) -> bool {
        !self.trees.is_empty() && self.trees.iter().all(Tree::is_loaded)
    }

    pub fn total_nodes(&self) -> usize {
        self.trees.iter().map(Tree::node_count).sum()
    }

    pub fn clear(&mut self) {
        self.trees.clear();
        self.unified = false;
    }

    /// Build the ensemble over the loaded training dataset. Returns one
    /// sorted, deduplicated in-bag id set per accepted tree (parallel to
    /// `trees()`), for out-of-bag scoring. Trees that come out empty are
    /// dropped and the ensemble continues with fewer members.
    pub fn make<H: HeapMonitor>(
        &mut self,
        data: &Dataset,
        cfg: &Config,
        rng: &Prng,
        predictor: &NodePredictor,
        heap: &H,
    ) -> Result<Vec<Vec<u16>>> {
        self.clear();
        if cfg.num_trees as usize > MAX_TREES {
            return Err(Error::CapacityExceeded);
        }
        let n = data.num_samples() as usize;
        if n == 0 {
            return Ok(Vec::new());
        }
        let num_labels = cfg.num_labels.max(data.label_histogram().len() as u8);
        let params = BuildParams {
            min_split: cfg.min_split,
            max_depth: cfg.max_depth,
            use_gini: cfg.use_gini,
            impurity_threshold: cfg.impurity_threshold,
            num_labels,
        };
        let node_hint = predictor.estimate(cfg.min_split, cfg.max_depth);
        let queue_hint = predictor.queue_peak(cfg.min_split, cfg.max_depth);

        let mut bags: Vec<Vec<u16>> = Vec::with_capacity(cfg.num_trees as usize);
        let mut seen_hashes: Vec<u32> = Vec::with_capacity(cfg.num_trees as usize);
        for t in 0..cfg.num_trees as u32 {
            let mut nonce = 0u32;
            let (ids, stream) = loop {
                let mut stream = rng.derive(t, nonce);
                let ids = if cfg.use_bootstrap {
                    (0..n).map(|_| stream.bounded(n as u32) as u16).collect()
                } else {
                    let k = ((n as f32 * cfg.bootstrap_ratio) as usize).clamp(1, n);
                    subsample(&mut stream, n, k)
                };
                let hash = Prng::hash_ids(&ids);
                if !seen_hashes.contains(&hash) {
                    seen_hashes.push(hash);
                    break (ids, stream);
                }
                nonce += 1;
                if nonce > MAX_BAG_REDRAWS {
                    log::warn!("tree {t}: no distinct bag after {MAX_BAG_REDRAWS} redraws");
                    break (ids, stream);
                }
            };

            let mut bag = ids.clone();
            bag.sort_unstable();
            bag.dedup();

            let index = self.trees.len() as u8;
            let tree = TreeBuilder::new(data, params, stream, heap)
                .build(index, ids, node_hint, queue_hint);
            if tree.node_count() == 0 {
                log::warn!("tree {t}: discarded (no nodes)");
                continue;
            }
            self.trees.push(tree);
            bags.push(bag);
        }
        log::debug!(
            "forest: built {} trees, {} nodes total",
            self.trees.len(),
            self.total_nodes()
        );
        Ok(bags)
    }

    /// Ensemble vote over all loaded trees.
    pub fn predict_packed(&self, features: &PackedVec2, unity_threshold: f32) -> u8 {
        self.vote(features, unity_threshold, |_| true)
    }

    /// Vote restricted to trees whose bag does not contain `sample_id`.
    pub fn oob_predict(
        &self,
        features: &PackedVec2,
        sample_id: u16,
        bags: &[Vec<u16>],
        unity_threshold: f32,
    ) -> u8 {
        self.vote(features, unity_threshold, |slot| {
            bags.get(slot)
                .is_some_and(|bag| bag.binary_search(&sample_id).is_err())
        })
    }

    fn vote(
        &self,
        features: &PackedVec2,
        unity_threshold: f32,
        use_tree: impl Fn(usize) -> bool,
    ) -> u8 {
        let mut votes = LinearMap::<u8, u16, 255>::new();
        let mut total = 0u32;
        for (slot, tree) in self.trees.iter().enumerate() {
            if !use_tree(slot) {
                continue;
            }
            let prediction = tree.classify(features);
            if prediction == LABEL_UNKNOWN {
                continue;
            }
            total += 1;
            if let Some(v) = votes.get_mut(&prediction) {
                *v += 1;
            } else {
                let _ = votes.insert(prediction, 1);
            }
        }
        if total == 0 {
            return LABEL_UNKNOWN;
        }
        let mut winner = LABEL_UNKNOWN;
        let mut best = 0u16;
        for (&label, &count) in votes.iter() {
            if count > best || (count == best && label < winner) {
                best = count;
                winner = label;
            }
        }
        if best as f32 / total as f32 >= unity_threshold {
            winner
        } else {
            LABEL_UNKNOWN
        }
    }

    /// Write the forest out (unified file or one file per tree), then drop
    /// the in-RAM nodes. Nodes are only cleared after every write succeeded.
    pub fn release<S: ObjectStore>(
        &mut self,
        store: &mut S,
        rindex: &ResourceIndex,
        unified: bool,
    ) -> Result<()> {
        if self.trees.is_empty() {
            return Err(Error::NotLoaded);
        }
        if unified {
            let path = rindex.path(SUFFIX_FOREST)?;
            io::write_forest(store, &path, &self.trees)?;
        } else {
            for tree in &self.trees {
                let path = rindex.tree_path(tree.index as usize)?;
                io::write_tree(store, &path, tree)?;
            }
        }
        for tree in &mut self.trees {
            tree.unload();
        }
        self.unified = unified;
        Ok(())
    }

    /// Load up to `num_trees` trees, preferring the unified file and falling
    /// back to per-tree files. The heap pre-flight runs once up front;
    /// per-tree failures degrade the ensemble and the loaded count is
    /// returned.
    pub fn load<P: ObjectStore + HeapMonitor>(
        &mut self,
        platform: &mut P,
        rindex: &ResourceIndex,
        num_trees: u8,
        estimated_ram: u32,
    ) -> Result<usize> {
        io::preflight_load(&*platform, estimated_ram)?;
        self.clear();
        let forest_path = rindex.path(SUFFIX_FOREST)?;
        if platform.exists(&forest_path) {
            self.trees = io::read_forest(platform, &forest_path, num_trees)?;
            self.unified = true;
        } else {
            for index in 0..num_trees as usize {
                let path = rindex.tree_path(index)?;
                if !platform.exists(&path) {
                    continue;
                }
                match io::read_tree(platform, &path, index as u8) {
                    Ok(tree) => self.trees.push(tree),
                    Err(e) => log::warn!("tree {index}: load failed ({e}), continuing"),
                }
            }
            self.unified = false;
        }
        Ok(self.trees.len())
    }
}

fn subsample(stream: &mut Prng, n: usize, k: usize) -> Vec<u16> {
    let mut pool: Vec<u16> = (0..n as u16).collect();
    for i in 0..k {
        let j = i + stream.bounded((n - i) as u32) as usize;
        pool.swap(i, j);
    }
    pool.truncate(k);
    pool
}
