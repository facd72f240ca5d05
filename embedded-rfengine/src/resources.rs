//! Artifact index for one model.
//!
//! Tracks which on-store artifacts exist for the model name, assembles their
//! paths from the closed suffix set, and renames the whole family when the
//! model is renamed. Paths are `"/" + model_name + suffix` and must fit
//! `MAX_FILE_PATH` bytes including the terminating NUL.

use core::fmt::Write;

use crate::store::ObjectStore;
use crate::{Error, Result, MAX_FILE_PATH, MAX_TREES};

pub const SUFFIX_BASE_DATA: &str = "_nml.bin";
pub const SUFFIX_RAW_DATA: &str = "_raw.csv";
pub const SUFFIX_CATEGORIZER: &str = "_ctg.csv";
pub const SUFFIX_DATA_PARAMS: &str = "_dp.csv";
pub const SUFFIX_CONFIG: &str = "_config.json";
pub const SUFFIX_FOREST: &str = "_forest.bin";
pub const SUFFIX_TREE: &str = "_tree_";
pub const SUFFIX_NODE_PREDICTOR: &str = "_node_pred.bin";
pub const SUFFIX_NODE_LOG: &str = "_node_log.csv";
pub const SUFFIX_INFER_LOG: &str = "_infer_log.bin";
pub const SUFFIX_TIME_LOG: &str = "_time_log.csv";

/// Longest suffix is `_node_pred.bin`; with the leading slash and NUL this
/// bounds the model name.
pub const MAX_MODEL_NAME: usize = 16;

pub type ArtifactPath = heapless::String<MAX_FILE_PATH>;

bitflags::bitflags! {
    /// Which artifacts exist on the store.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Artifacts: u16 {
        const BASE_DATA_BIN = 1 << 0;
        const BASE_DATA_CSV = 1 << 1;
        const CATEGORIZER = 1 << 2;
        const DATA_PARAMS = 1 << 3;
        const CONFIG = 1 << 4;
        const UNIFIED_FOREST = 1 << 5;
        const NODE_PREDICTOR = 1 << 6;
        const INFER_LOG = 1 << 7;
        /// At least one per-tree file (non-unified forest layout).
        const PER_TREE = 1 << 8;
    }
}

const SCANNED: &[(Artifacts, &str)] = &[
    (Artifacts::BASE_DATA_BIN, SUFFIX_BASE_DATA),
    (Artifacts::BASE_DATA_CSV, SUFFIX_RAW_DATA),
    (Artifacts::CATEGORIZER, SUFFIX_CATEGORIZER),
    (Artifacts::DATA_PARAMS, SUFFIX_DATA_PARAMS),
    (Artifacts::CONFIG, SUFFIX_CONFIG),
    (Artifacts::UNIFIED_FOREST, SUFFIX_FOREST),
    (Artifacts::NODE_PREDICTOR, SUFFIX_NODE_PREDICTOR),
    (Artifacts::INFER_LOG, SUFFIX_INFER_LOG),
];

#[derive(Debug)]
pub struct ResourceIndex {
    model: heapless::String<MAX_MODEL_NAME>,
    flags: Artifacts,
}

impl ResourceIndex {
    pub fn new(model: &str) -> Result<Self> {
        let mut name = heapless::String::new();
        if model.is_empty() {
            return Err(Error::CapacityExceeded);
        }
        name.push_str(model).map_err(|_| Error::CapacityExceeded)?;
        Ok(ResourceIndex {
            model: name,
            flags: Artifacts::empty(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn flags(&self) -> Artifacts {
        self.flags
    }

    pub fn mark(&mut self, artifact: Artifacts) {
        self.flags |= artifact;
    }

    pub fn unmark(&mut self, artifact: Artifacts) {
        self.flags &= !artifact;
    }

    pub fn has(&self, artifact: Artifacts) -> bool {
        self.flags.contains(artifact)
    }

    /// Assemble `"/" + model + suffix`.
    pub fn path(&self, suffix: &str) -> Result<ArtifactPath> {
        Self::path_for(&self.model, suffix)
    }

    fn path_for(model: &str, suffix: &str) -> Result<ArtifactPath> {
        let mut p = ArtifactPath::new();
        write!(p, "/{model}{suffix}").map_err(|_| Error::CapacityExceeded)?;
        if p.len() + 1 > MAX_FILE_PATH {
            return Err(Error::CapacityExceeded);
        }
        Ok(p)
    }

    /// Path of per-tree file `index`.
    pub fn tree_path(&self, index: usize) -> Result<ArtifactPath> {
        Self::tree_path_for(&self.model, index)
    }

    fn tree_path_for(model: &str, index: usize) -> Result<ArtifactPath> {
        let mut p = ArtifactPath::new();
        write!(p, "/{model}{SUFFIX_TREE}{index}.bin").map_err(|_| Error::CapacityExceeded)?;
        if p.len() + 1 > MAX_FILE_PATH {
            return Err(Error::CapacityExceeded);
        }
        Ok(p)
    }

    /// Probe the store and rebuild the artifact bitset.
    pub fn scan<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let mut flags = Artifacts::empty();
        for &(bit, suffix) in SCANNED {
            if store.exists(&self.path(suffix)?) {
                flags |= bit;
            }
        }
        if store.exists(&self.tree_path(0)?) {
            flags |= Artifacts::PER_TREE;
        }
        self.flags = flags;
        Ok(())
    }

    /// Forest (unified or per-tree) plus categorizer.
    pub fn ready_for_inference(&self) -> bool {
        self.flags.contains(Artifacts::CATEGORIZER)
            && self
                .flags
                .intersects(Artifacts::UNIFIED_FOREST | Artifacts::PER_TREE)
    }

    /// Base data plus categorizer.
    pub fn ready_for_training(&self) -> bool {
        self.flags
            .contains(Artifacts::BASE_DATA_BIN | Artifacts::CATEGORIZER)
    }

    /// Rename every artifact of this model, per-tree files included. The
    /// cascade is best-effort: individual failures are logged and skipped so
    /// prior successful renames are not unwound.
    pub fn rename<S: ObjectStore>(&mut self, store: &mut S, new_model: &str) -> Result<()> {
        let mut name = heapless::String::new();
        if new_model.is_empty() {
            return Err(Error::CapacityExceeded);
        }
        name.push_str(new_model)
            .map_err(|_| Error::CapacityExceeded)?;

        for &(bit, suffix) in SCANNED {
            if !self.flags.contains(bit) {
                continue;
            }
            let from = self.path(suffix)?;
            let to = Self::path_for(&name, suffix)?;
            if let Err(e) = store.rename(&from, &to) {
                log::warn!("rename {from} -> {to}: {e}");
                self.flags &= !bit;
            }
        }
        // The rolling logs are not tracked in the bitset but still belong to
        // the model family.
        for suffix in [SUFFIX_NODE_LOG, SUFFIX_TIME_LOG] {
            let from = self.path(suffix)?;
            if !store.exists(&from) {
                continue;
            }
            let to = Self::path_for(&name, suffix)?;
            if let Err(e) = store.rename(&from, &to) {
                log::warn!("rename {from} -> {to}: {e}");
            }
        }
        for index in 0..MAX_TREES {
            let from = self.tree_path(index)?;
            if !store.exists(&from) {
                continue;
            }
            let to = Self::tree_path_for(&name, index)?;
            if let Err(e) = store.rename(&from, &to) {
                log::warn!("rename {from} -> {to}: {e}");
            }
        }
        self.model = name;
        Ok(())
    }
}
