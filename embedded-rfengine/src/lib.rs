//! On-device random-forest classifier engine for flash-backed
//! microcontroller-class targets.
//!
//! The engine trains an ensemble of shallow decision trees over a packed,
//! chunked sample store, sweeps `(min_split, max_depth)` combinations under a
//! combined out-of-bag / validation score, and serves single-sample
//! predictions while collecting labelled feedback for incremental extension
//! of the training set. All artifacts live in a host-provided object store
//! behind the [`store::ObjectStore`] trait.

pub mod categorizer;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod feedback;
pub mod forest;
pub mod grid;
pub mod packed;
pub mod predictor;
pub mod resources;
pub mod rng;
pub mod score;
pub mod store;
pub mod tree;

/// Hard platform caps. Values above these are refused at the API boundary,
/// never truncated.
pub const MAX_TREES: usize = 100;
pub const MAX_LABELS: usize = 255;
pub const MAX_NUM_FEATURES: u16 = 1023;
pub const MAX_NUM_SAMPLES: u32 = 65_535;
pub const MAX_NODES_PER_TREE: u16 = 2047;
pub const MAX_DATASET_BYTES: u32 = 150_000;
pub const MAX_INFER_LOG_BYTES: u32 = 2048;
/// Maximum artifact path length, terminating NUL included.
pub const MAX_FILE_PATH: usize = 32;

/// Reserved label id meaning "unknown" on prediction and "unanswered" in the
/// feedback buffer.
pub const LABEL_UNKNOWN: u8 = 255;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage i/o failure")]
    Io(#[from] std::io::Error),
    #[error("file magic or geometry disagrees with expectation")]
    HeaderMismatch,
    #[error("record or tree cut short of its declared length")]
    Truncated,
    #[error("value exceeds a platform limit")]
    CapacityExceeded,
    #[error("pre-flight heap check failed")]
    InsufficientMemory,
    #[error("pre-flight free-space check failed")]
    InsufficientStorage,
    #[error("access to a released dataset, tree, or forest")]
    NotLoaded,
    #[error("table row failed validation")]
    MalformedTable,
    #[error("a prerequisite artifact is missing")]
    NotReady,
}

pub type Result<T> = core::result::Result<T, Error>;

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }
}
