//! Linear node-count predictor.
//!
//! A three-coefficient model estimating how many nodes a tree built with a
//! given `(min_split, max_depth)` will hold. The estimate pre-sizes tree
//! buffers and the BFS work queue, so it only has to be in the right
//! neighbourhood. Observations accumulate in a rolling CSV log (newest
//! first, 50 rows); retraining derives each slope from the difference in
//! mean node counts between the extreme observed values of that parameter.

use std::io::Write;

use serde::{Deserialize, Serialize};
use zerocopy::byteorder::little_endian::{F32, U32};

use crate::store::{read_all, ObjectStore, OpenMode};
use crate::{Error, Result, MAX_NODES_PER_TREE};

pub const PREDICTOR_MAGIC: u32 = 0x4E4F_4445; // "NODE"
pub const LOG_CAP: usize = 50;
const NUM_COEFFS: usize = 3;
const FILE_BYTES: usize = 8 + NUM_COEFFS * 4;
/// Queue pre-sizing never exceeds this many work items.
const QUEUE_CAP: u16 = 120;
const MIN_ESTIMATE: f32 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRow {
    pub min_split: u16,
    pub max_depth: u8,
    pub total_nodes: u16,
}

#[derive(Debug, Clone)]
pub struct NodePredictor {
    coeffs: [f32; NUM_COEFFS],
    trained: bool,
    accuracy: u8,
    peak_percent: u8,
}

impl Default for NodePredictor {
    fn default() -> Self {
        NodePredictor {
            coeffs: [0.0; NUM_COEFFS],
            trained: false,
            accuracy: 0,
            peak_percent: 30,
        }
    }
}

impl NodePredictor {
    pub fn trained(&self) -> bool {
        self.trained
    }

    pub fn accuracy(&self) -> u8 {
        self.accuracy
    }

    pub fn peak_percent(&self) -> u8 {
        self.peak_percent
    }

    pub fn coeffs(&self) -> [f32; NUM_COEFFS] {
        self.coeffs
    }

    /// Expected node count for one tree, never below 10 and never above the
    /// per-tree cap. Falls back to a geometric bound damped by `min_split`
    /// until the model has been trained.
    pub fn estimate(&self, min_split: u16, max_depth: u8) -> u16 {
        let raw = if self.trained {
            self.coeffs[0]
                + self.coeffs[1] * min_split as f32
                + self.coeffs[2] * max_depth as f32
        } else {
            (1u32 << max_depth.min(10)) as f32 / (min_split.max(1) as f32).sqrt()
        };
        raw.clamp(MIN_ESTIMATE, MAX_NODES_PER_TREE as f32) as u16
    }

    /// Work-queue pre-size: the calibrated peak fraction of a tree's nodes
    /// ever live in the BFS queue at once, capped at 120 items.
    pub fn queue_peak(&self, min_split: u16, max_depth: u8) -> u16 {
        let peak = self.estimate(min_split, max_depth) as u32 * self.peak_percent as u32 / 100;
        (peak as u16).clamp(1, QUEUE_CAP)
    }

    pub fn load<S: ObjectStore>(store: &mut S, path: &str) -> Result<Self> {
        let bytes = read_all(store, path)?;
        if bytes.len() < 8 {
            return Err(Error::Truncated);
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != PREDICTOR_MAGIC {
            return Err(Error::HeaderMismatch);
        }
        if bytes[7] as usize != NUM_COEFFS {
            return Err(Error::HeaderMismatch);
        }
        if bytes.len() < FILE_BYTES {
            return Err(Error::Truncated);
        }
        let mut coeffs = [0.0f32; NUM_COEFFS];
        for (k, c) in coeffs.iter_mut().enumerate() {
            let at = 8 + k * 4;
            *c = f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
        Ok(NodePredictor {
            coeffs,
            trained: bytes[4] != 0,
            accuracy: bytes[5],
            peak_percent: bytes[6],
        })
    }

    /// Persist the model. A partial write is removed before the error is
    /// returned.
    pub fn release<S: ObjectStore>(&self, store: &mut S, path: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(FILE_BYTES);
        bytes.extend_from_slice(&U32::new(PREDICTOR_MAGIC).to_bytes());
        bytes.push(self.trained as u8);
        bytes.push(self.accuracy);
        bytes.push(self.peak_percent);
        bytes.push(NUM_COEFFS as u8);
        for c in self.coeffs {
            bytes.extend_from_slice(&F32::new(c).to_bytes());
        }
        let result = store
            .open(path, OpenMode::Write)
            .and_then(|mut f| Ok(f.write_all(&bytes)?));
        if result.is_err() {
            if let Err(e) = store.remove(path) {
                log::warn!("predictor {path}: cleanup after failed write: {e}");
            }
        }
        result
    }

    /// Prepend one observation to the rolling log, evicting the oldest rows
    /// past the cap. The rewrite goes through a temp object and a rename so
    /// the log is never half-written.
    pub fn append_observation<S: ObjectStore>(
        store: &mut S,
        log_path: &str,
        row: LogRow,
    ) -> Result<()> {
        let mut rows = Self::read_log(store, log_path)?;
        rows.insert(0, row);
        rows.truncate(LOG_CAP);

        let mut tmp = String::from(log_path);
        tmp.push('~');
        {
            let handle = store.open(&tmp, OpenMode::Write)?;
            let mut wtr = csv::Writer::from_writer(handle);
            for r in &rows {
                wtr.serialize(r).map_err(|_| Error::MalformedTable)?;
            }
            wtr.flush()?;
        }
        store.rename(&tmp, log_path)
    }

    pub fn read_log<S: ObjectStore>(store: &mut S, log_path: &str) -> Result<Vec<LogRow>> {
        if !store.exists(log_path) {
            return Ok(Vec::new());
        }
        let bytes = read_all(store, log_path)?;
        let mut rdr = csv::Reader::from_reader(bytes.as_slice());
        let mut rows = Vec::new();
        for row in rdr.deserialize() {
            rows.push(row.map_err(|_| Error::MalformedTable)?);
        }
        Ok(rows)
    }

    /// Refit the coefficients from the rolling log.
    pub fn retrain<S: ObjectStore>(&mut self, store: &mut S, log_path: &str) -> Result<()> {
        let rows = Self::read_log(store, log_path)?;
        if rows.is_empty() {
            self.trained = false;
            self.accuracy = 0;
            return Ok(());
        }

        let mean_nodes = mean(rows.iter().map(|r| r.total_nodes as f32));
        let mean_ms = mean(rows.iter().map(|r| r.min_split as f32));
        let mean_md = mean(rows.iter().map(|r| r.max_depth as f32));

        let b1 = effect(&rows, |r| r.min_split as f32);
        let b2 = effect(&rows, |r| r.max_depth as f32);
        let b0 = mean_nodes - b1 * mean_ms - b2 * mean_md;
        self.coeffs = [b0, b1, b2];
        self.trained = true;

        // Accuracy is 100 minus the mean absolute percentage error over the
        // log, clamped to [0, 100].
        let mut mape = 0.0f32;
        let mut counted = 0u32;
        for r in &rows {
            if r.total_nodes == 0 {
                continue;
            }
            let est = self.estimate(r.min_split, r.max_depth) as f32;
            mape += (est - r.total_nodes as f32).abs() / r.total_nodes as f32;
            counted += 1;
        }
        let mape = if counted == 0 {
            100.0
        } else {
            mape * 100.0 / counted as f32
        };
        self.accuracy = (100.0 - mape).clamp(0.0, 100.0) as u8;
        log::debug!(
            "node predictor: retrained on {} rows, accuracy {}",
            rows.len(),
            self.accuracy
        );
        Ok(())
    }
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let mut sum = 0.0;
    let mut n = 0u32;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f32
    }
}

/// Slope of `total_nodes` along one parameter: difference in mean node count
/// between the extreme observed values, divided by the parameter range.
/// Zero when fewer than two distinct values were observed.
fn effect(rows: &[LogRow], param: impl Fn(&LogRow) -> f32) -> f32 {
    let mut lo = f32::MAX;
    let mut hi = f32::MIN;
    for r in rows {
        lo = lo.min(param(r));
        hi = hi.max(param(r));
    }
    if hi <= lo {
        return 0.0;
    }
    let at = |v: f32| mean(
        rows.iter()
            .filter(|r| param(r) == v)
            .map(|r| r.total_nodes as f32),
    );
    (at(hi) - at(lo)) / (hi - lo)
}
