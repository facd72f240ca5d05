//! Hyperparameter and dataset-statistics record.
//!
//! Persisted two ways: the full record as flat JSON (unknown fields such as
//! `timestamp` and `author` survive a rewrite), and the dataset statistics as
//! the `parameter,value` data-params CSV consumed by host tooling.

use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::store::{read_all, ObjectStore, OpenMode};
use crate::{Error, Result, MAX_NUM_FEATURES, MAX_NUM_SAMPLES, MAX_TREES};

bitflags::bitflags! {
    /// Which metrics contribute to the training score. At least one bit is
    /// always honoured; an empty mask falls back to accuracy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MetricMask: u8 {
        const ACCURACY = 1;
        const PRECISION = 2;
        const RECALL = 4;
        const F1 = 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingScore {
    Oob,
    Valid,
    KFold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Hyperparameters.
    pub num_trees: u8,
    pub min_split: u16,
    pub max_depth: u8,
    pub use_bootstrap: bool,
    pub bootstrap_ratio: f32,
    pub use_gini: bool,
    pub k_fold: u8,
    pub unity_threshold: f32,
    pub impurity_threshold: f32,
    pub train_ratio: f32,
    pub test_ratio: f32,
    pub valid_ratio: f32,
    pub combine_ratio: f32,
    pub metric_score: u8,
    pub training_score: TrainingScore,

    // Grid-search ranges (derived by `auto_configure` or loaded from disk).
    pub min_split_range: Vec<u16>,
    pub max_depth_range: Vec<u8>,

    // Dataset statistics.
    pub num_samples: u32,
    pub num_features: u16,
    pub num_labels: u8,
    pub samples_per_label: Vec<u32>,

    // Footprint estimate for the load pre-flight check, bytes.
    pub estimated_ram: u32,

    // UI toggles.
    pub extend_base_data: bool,
    pub enable_retrain: bool,
    pub enable_auto_config: bool,

    /// Fields this engine does not interpret (`timestamp`, `author`, ...)
    /// but must preserve across rewrites.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_trees: 10,
            min_split: 2,
            max_depth: 8,
            use_bootstrap: true,
            bootstrap_ratio: 0.66,
            use_gini: true,
            k_fold: 5,
            unity_threshold: 0.5,
            impurity_threshold: 0.01,
            train_ratio: 0.7,
            test_ratio: 0.3,
            valid_ratio: 0.0,
            combine_ratio: 0.5,
            metric_score: MetricMask::ACCURACY.bits(),
            training_score: TrainingScore::Oob,
            min_split_range: Vec::new(),
            max_depth_range: Vec::new(),
            num_samples: 0,
            num_features: 0,
            num_labels: 0,
            samples_per_label: Vec::new(),
            estimated_ram: 16 * 1024,
            extend_base_data: true,
            enable_retrain: true,
            enable_auto_config: true,
            extra: serde_json::Map::new(),
        }
    }
}

impl Config {
    pub fn metric_mask(&self) -> MetricMask {
        let mask = MetricMask::from_bits_truncate(self.metric_score);
        if mask.is_empty() {
            MetricMask::ACCURACY
        } else {
            mask
        }
    }

    /// Scale the split ratios so they sum to exactly 1.
    pub fn normalize_ratios(&mut self) {
        let sum = self.train_ratio + self.test_ratio + self.valid_ratio;
        if sum <= 0.0 || !sum.is_finite() {
            self.train_ratio = 0.7;
            self.test_ratio = 0.3;
            self.valid_ratio = 0.0;
            return;
        }
        self.train_ratio /= sum;
        self.test_ratio /= sum;
        self.valid_ratio /= sum;
    }

    /// Derive forest size and the grid ranges from the dataset shape.
    pub fn auto_configure(&mut self) {
        let n = self.num_samples.max(1);
        self.num_trees = (n / 10).clamp(5, 25) as u8;

        let mut ms: Vec<u16> = vec![2, (n / 50).max(2) as u16, (n / 20).max(2) as u16];
        ms.sort_unstable();
        ms.dedup();
        self.min_split_range = ms;

        let depth_for_n = (32 - n.leading_zeros()).clamp(4, 11) as u8;
        let mut md: Vec<u8> = vec![4, depth_for_n.min(8), depth_for_n];
        md.sort_unstable();
        md.dedup();
        self.max_depth_range = md;

        self.min_split = self.min_split_range[0];
        self.max_depth = self.max_depth_range[self.max_depth_range.len() - 1];
        self.estimated_ram = self.num_trees as u32 * 1024 + 8192;
    }

    /// Recompute the per-label statistics from a loaded dataset.
    pub fn scan_dataset(&mut self, data: &Dataset) {
        self.num_samples = data.num_samples();
        self.num_features = data.num_features();
        self.samples_per_label = data.label_histogram();
        self.num_labels = self.samples_per_label.len() as u8;
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_trees as usize > MAX_TREES
            || self.num_features > MAX_NUM_FEATURES
            || self.num_samples > MAX_NUM_SAMPLES
        {
            return Err(Error::CapacityExceeded);
        }
        Ok(())
    }

    pub fn load_json<S: ObjectStore>(store: &mut S, path: &str) -> Result<Self> {
        let bytes = read_all(store, path)?;
        let mut cfg: Config =
            serde_json::from_slice(&bytes).map_err(|_| Error::MalformedTable)?;
        cfg.validate()?;
        cfg.normalize_ratios();
        Ok(cfg)
    }

    /// Persist as flat JSON; a partial write is removed before the error is
    /// returned.
    pub fn save_json<S: ObjectStore>(&self, store: &mut S, path: &str) -> Result<()> {
        use std::io::Write;
        let bytes = serde_json::to_vec_pretty(self).map_err(|_| Error::MalformedTable)?;
        let result = store
            .open(path, OpenMode::Write)
            .and_then(|mut f| Ok(f.write_all(&bytes)?));
        if result.is_err() {
            if let Err(e) = store.remove(path) {
                log::warn!("config {path}: cleanup after failed write: {e}");
            }
        }
        result
    }

    /// Write the data-params CSV: fixed quantization constants followed by
    /// the dataset statistics and one row per used label.
    pub fn save_data_params<S: ObjectStore>(&self, store: &mut S, path: &str) -> Result<()> {
        let handle = store.open(path, OpenMode::Write)?;
        let mut wtr = csv::Writer::from_writer(handle);
        let io = |e: csv::Error| Error::Io(std::io::Error::other(e));
        wtr.write_record(["parameter", "value"]).map_err(io)?;
        wtr.write_record(["quantization_coefficient", "2"]).map_err(io)?;
        wtr.write_record(["max_feature_value", "3"]).map_err(io)?;
        wtr.write_record(["features_per_byte", "4"]).map_err(io)?;
        wtr.write_record(["num_features", self.num_features.to_string().as_str()])
            .map_err(io)?;
        wtr.write_record(["num_samples", self.num_samples.to_string().as_str()])
            .map_err(io)?;
        wtr.write_record(["num_labels", self.num_labels.to_string().as_str()])
            .map_err(io)?;
        for (label, &count) in self.samples_per_label.iter().enumerate() {
            if count == 0 {
                continue;
            }
            wtr.write_record([format!("samples_label_{label}"), count.to_string()])
                .map_err(io)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Read the data-params CSV back into the statistics fields, validating
    /// the fixed quantization constants.
    pub fn load_data_params<S: ObjectStore>(&mut self, store: &mut S, path: &str) -> Result<()> {
        let bytes = read_all(store, path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes.as_slice());
        let mut samples_per_label: Vec<u32> = Vec::new();
        for row in rdr.records() {
            let row = row.map_err(|_| Error::MalformedTable)?;
            let (key, value) = match (row.get(0), row.get(1)) {
                (Some(k), Some(v)) => (k.trim(), v.trim()),
                _ => return Err(Error::MalformedTable),
            };
            let parsed: u32 = value.parse().map_err(|_| Error::MalformedTable)?;
            match key {
                "quantization_coefficient" if parsed != 2 => return Err(Error::MalformedTable),
                "max_feature_value" if parsed != 3 => return Err(Error::MalformedTable),
                "features_per_byte" if parsed != 4 => return Err(Error::MalformedTable),
                "quantization_coefficient" | "max_feature_value" | "features_per_byte" => {}
                "num_features" => {
                    if parsed > MAX_NUM_FEATURES as u32 {
                        return Err(Error::CapacityExceeded);
                    }
                    self.num_features = parsed as u16;
                }
                "num_samples" => {
                    if parsed > MAX_NUM_SAMPLES {
                        return Err(Error::CapacityExceeded);
                    }
                    self.num_samples = parsed;
                }
                "num_labels" => self.num_labels = parsed.min(255) as u8,
                _ => {
                    let Some(label) = key.strip_prefix("samples_label_") else {
                        return Err(Error::MalformedTable);
                    };
                    let label: usize = label.parse().map_err(|_| Error::MalformedTable)?;
                    if samples_per_label.len() <= label {
                        samples_per_label.resize(label + 1, 0);
                    }
                    samples_per_label[label] = parsed;
                }
            }
        }
        if samples_per_label.len() > self.num_labels as usize {
            return Err(Error::MalformedTable);
        }
        samples_per_label.resize(self.num_labels as usize, 0);
        let total: u32 = samples_per_label.iter().sum();
        if total != self.num_samples {
            return Err(Error::MalformedTable);
        }
        self.samples_per_label = samples_per_label;
        Ok(())
    }
}
