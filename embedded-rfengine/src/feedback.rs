//! Prediction/label pairing and the capped inference log.
//!
//! Predictions queue up here until the operator supplies ground truth. The
//! two buffers stay parallel: the i-th actual answers the i-th prediction.
//! An answer arriving more than `max_wait_time` after the previous one first
//! pads the gap with ignored slots, one per elapsed window, because the
//! predictions made in between are no longer answerable. A flush turns every
//! answered pair into a dataset record (append or ring-overwrite) and an
//! entry in the `INFL` inference log.

use std::io::{Seek, SeekFrom, Write};

use crate::config::Config;
use crate::dataset::{Dataset, Sample};
use crate::store::{read_all, read_exact_or_truncated, ObjectStore, OpenMode};
use crate::{Error, Result, LABEL_UNKNOWN, MAX_INFER_LOG_BYTES, MAX_NUM_SAMPLES};

pub const INFER_LOG_MAGIC: u32 = 0x4C46_4E49; // "INFL"
const LOG_HEADER_BYTES: usize = 8;
/// Pairs the log file can hold within its byte cap.
const PAIR_BUDGET: usize = (MAX_INFER_LOG_BYTES as usize - LOG_HEADER_BYTES) / 2;

pub const DEFAULT_CAPACITY: usize = 16;
pub const DEFAULT_MAX_WAIT_MS: u64 = 30_000;

/// Millisecond clock for the late-answer accounting.
pub trait TimeSource {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[derive(Debug)]
pub struct PendingFeedback {
    samples: Vec<Sample>,
    actuals: Vec<u8>,
    last_actual_ms: u64,
    max_wait_ms: u64,
    capacity: usize,
}

impl Default for PendingFeedback {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_WAIT_MS)
    }
}

impl PendingFeedback {
    pub fn new(capacity: usize, max_wait_ms: u64) -> Self {
        PendingFeedback {
            samples: Vec::with_capacity(capacity),
            actuals: Vec::with_capacity(capacity),
            last_actual_ms: 0,
            max_wait_ms: max_wait_ms.max(1),
            capacity: capacity.max(1),
        }
    }

    /// Queue a prediction (label = predicted id, possibly 255).
    pub fn record_prediction(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// The buffer wants a flush once it reaches capacity.
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn pending(&self) -> usize {
        self.samples.len()
    }

    pub fn answered(&self) -> usize {
        self.actuals
            .iter()
            .filter(|&&a| a != LABEL_UNKNOWN)
            .count()
    }

    /// Record ground truth for the oldest unanswered prediction. Each full
    /// `max_wait_time` window elapsed since the previous answer first burns
    /// one slot as unanswerable.
    pub fn record_actual(&mut self, label: u8, now_ms: u64) {
        if self.last_actual_ms != 0 && now_ms > self.last_actual_ms {
            let skipped = (now_ms - self.last_actual_ms) / self.max_wait_ms;
            for _ in 0..skipped {
                if self.actuals.len() < self.samples.len() {
                    self.actuals.push(LABEL_UNKNOWN);
                }
            }
        }
        if self.actuals.len() < self.samples.len() {
            self.actuals.push(label);
        }
        self.last_actual_ms = now_ms;
    }

    /// Write every answered pair out: `(features, actual)` into the base
    /// dataset, `(predicted, actual)` into the inference log; then clear
    /// both buffers. Per-label counters in `cfg` follow the dataset change.
    pub fn flush<S: ObjectStore>(
        &mut self,
        store: &mut S,
        data: &mut Dataset,
        cfg: &mut Config,
        infer_log_path: &str,
    ) -> Result<()> {
        let mut answered: Vec<Sample> = Vec::new();
        let mut pairs: Vec<(u8, u8)> = Vec::new();
        for (i, sample) in self.samples.iter().enumerate() {
            let actual = self.actuals.get(i).copied().unwrap_or(LABEL_UNKNOWN);
            if actual == LABEL_UNKNOWN {
                continue;
            }
            answered.push(Sample {
                label: actual,
                features: sample.features.clone(),
            });
            pairs.push((sample.label, actual));
        }

        if !answered.is_empty() {
            let outcome = data.append(store, &answered, cfg.extend_base_data)?;
            if cfg.extend_base_data {
                for sample in &answered[..outcome.accepted] {
                    bump_label(cfg, sample.label);
                }
                cfg.num_samples =
                    (cfg.num_samples + outcome.accepted as u32).min(MAX_NUM_SAMPLES);
            } else {
                // Ring-overwrite: totals stay fixed, displaced labels are
                // handed back so the counters stay consistent.
                for &old in &outcome.displaced {
                    drop_label(cfg, old);
                }
                for sample in &answered[..outcome.accepted] {
                    bump_label(cfg, sample.label);
                }
            }
        }
        if !pairs.is_empty() {
            append_infer_log(store, infer_log_path, &pairs)?;
        }
        self.samples.clear();
        self.actuals.clear();
        Ok(())
    }
}

fn bump_label(cfg: &mut Config, label: u8) {
    let l = label as usize;
    if cfg.samples_per_label.len() <= l {
        cfg.samples_per_label.resize(l + 1, 0);
        cfg.num_labels = cfg.samples_per_label.len() as u8;
    }
    cfg.samples_per_label[l] += 1;
}

fn drop_label(cfg: &mut Config, label: u8) {
    if let Some(count) = cfg.samples_per_label.get_mut(label as usize) {
        *count = count.saturating_sub(1);
    }
}

/// Append pairs to the inference log, creating it on first use. When the
/// append would push the file past its byte cap, the log is rewritten with
/// the most recent half of the pair budget; the 8-byte header stays intact.
pub fn append_infer_log<S: ObjectStore>(
    store: &mut S,
    path: &str,
    pairs: &[(u8, u8)],
) -> Result<()> {
    let existing = if store.exists(path) {
        read_infer_log(store, path)?
    } else {
        Vec::new()
    };
    let projected = LOG_HEADER_BYTES + (existing.len() + pairs.len()) * 2;
    if projected > MAX_INFER_LOG_BYTES as usize {
        let mut all = existing;
        all.extend_from_slice(pairs);
        let keep = PAIR_BUDGET / 2;
        if all.len() > keep {
            all.drain(..all.len() - keep);
        }
        return write_infer_log(store, path, &all);
    }

    let mut f = store.open(path, OpenMode::ReadWrite)?;
    let end = f.seek(SeekFrom::End(0))?;
    let count = existing.len() as u32;
    if end == 0 {
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&INFER_LOG_MAGIC.to_le_bytes())?;
        f.write_all(&0u32.to_le_bytes())?;
    }
    f.seek(SeekFrom::Start(
        (LOG_HEADER_BYTES + count as usize * 2) as u64,
    ))?;
    for &(predicted, actual) in pairs {
        f.write_all(&[predicted, actual])?;
    }
    let new_count = count + pairs.len() as u32;
    f.seek(SeekFrom::Start(4))?;
    f.write_all(&new_count.to_le_bytes())?;
    f.flush()?;
    Ok(())
}

fn write_infer_log<S: ObjectStore>(store: &mut S, path: &str, pairs: &[(u8, u8)]) -> Result<()> {
    let mut bytes = Vec::with_capacity(LOG_HEADER_BYTES + pairs.len() * 2);
    bytes.extend_from_slice(&INFER_LOG_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for &(predicted, actual) in pairs {
        bytes.push(predicted);
        bytes.push(actual);
    }
    let result = store
        .open(path, OpenMode::Write)
        .and_then(|mut f| Ok(f.write_all(&bytes)?));
    if result.is_err() {
        if let Err(e) = store.remove(path) {
            log::warn!("inference log {path}: cleanup after failed write: {e}");
        }
    }
    result
}

/// Read the full inference log, validating magic and the count against the
/// file length.
pub fn read_infer_log<S: ObjectStore>(store: &mut S, path: &str) -> Result<Vec<(u8, u8)>> {
    let mut f = store.open(path, OpenMode::Read)?;
    let mut hdr = [0u8; LOG_HEADER_BYTES];
    read_exact_or_truncated(&mut f, &mut hdr)?;
    let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    if magic != INFER_LOG_MAGIC {
        return Err(Error::HeaderMismatch);
    }
    let count = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]) as usize;
    let mut body = Vec::new();
    std::io::Read::read_to_end(&mut f, &mut body)?;
    if body.len() < count * 2 {
        return Err(Error::Truncated);
    }
    if body.len() > count * 2 {
        return Err(Error::HeaderMismatch);
    }
    Ok(body.chunks_exact(2).map(|c| (c[0], c[1])).collect())
}

/// (count, agreement rate over answered pairs) for inspection surfaces.
pub fn summarize_infer_log<S: ObjectStore>(store: &mut S, path: &str) -> Result<(u32, f32)> {
    let pairs = read_infer_log(store, path)?;
    let answered: Vec<_> = pairs
        .iter()
        .filter(|(p, a)| *p != LABEL_UNKNOWN && *a != LABEL_UNKNOWN)
        .collect();
    let agreement = if answered.is_empty() {
        0.0
    } else {
        answered.iter().filter(|(p, a)| p == a).count() as f32 / answered.len() as f32
    };
    Ok((pairs.len() as u32, agreement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packed::PackedVec2;
    use crate::store::DirStore;

    const LOG: &str = "/m_infer_log.bin";

    fn sample(label: u8) -> Sample {
        let mut features = PackedVec2::new();
        for v in [label & 3, 1, 2, 3] {
            features.push_back(v);
        }
        Sample { label, features }
    }

    fn store() -> (tempfile::TempDir, DirStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = DirStore::new(dir.path());
        (dir, s)
    }

    fn seeded_dataset(store: &mut DirStore, n: usize) -> (Dataset, Config) {
        let mut ds = Dataset::init("/m_nml.bin", 4).unwrap();
        ds.begin_empty().unwrap();
        for i in 0..n {
            ds.push_sample(&sample((i % 2) as u8)).unwrap();
        }
        let mut cfg = Config::default();
        cfg.scan_dataset(&ds);
        ds.release(store, false).unwrap();
        (ds, cfg)
    }

    #[test]
    fn actuals_pair_in_order() {
        let mut pf = PendingFeedback::new(8, 1000);
        pf.record_prediction(sample(0));
        pf.record_prediction(sample(1));
        pf.record_actual(5, 1000);
        pf.record_actual(6, 1500);
        assert_eq!(pf.answered(), 2);
        assert_eq!(pf.pending(), 2);
    }

    #[test]
    fn late_answers_burn_slots() {
        let mut pf = PendingFeedback::new(8, 1000);
        for _ in 0..4 {
            pf.record_prediction(sample(0));
        }
        pf.record_actual(1, 10_000);
        // 2.5 windows elapsed: two predictions become unanswerable first.
        pf.record_actual(2, 12_500);
        assert_eq!(pf.actuals, vec![1, LABEL_UNKNOWN, LABEL_UNKNOWN, 2]);
    }

    #[test]
    fn answers_without_predictions_are_dropped() {
        let mut pf = PendingFeedback::new(8, 1000);
        pf.record_actual(3, 50);
        assert_eq!(pf.answered(), 0);
    }

    #[test]
    fn flush_extend_appends_and_counts() {
        let (_d, mut s) = store();
        let (mut ds, mut cfg) = seeded_dataset(&mut s, 6);
        cfg.extend_base_data = true;

        let mut pf = PendingFeedback::new(8, 1000);
        pf.record_prediction(sample(0));
        pf.record_prediction(sample(1));
        pf.record_prediction(sample(0));
        pf.record_actual(1, 100);
        pf.record_actual(0, 200);
        // Third prediction never answered.
        pf.flush(&mut s, &mut ds, &mut cfg, LOG).unwrap();

        assert_eq!(ds.num_samples(), 8);
        assert_eq!(cfg.num_samples, 8);
        assert_eq!(cfg.samples_per_label, vec![4, 4]);
        assert_eq!(pf.pending(), 0);

        let pairs = read_infer_log(&mut s, LOG).unwrap();
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn flush_ring_keeps_totals() {
        let (_d, mut s) = store();
        let (mut ds, mut cfg) = seeded_dataset(&mut s, 6);
        cfg.extend_base_data = false;
        let size_before = s.size("/m_nml.bin").unwrap();

        let mut pf = PendingFeedback::new(8, 1000);
        pf.record_prediction(sample(1));
        pf.record_prediction(sample(1));
        pf.record_actual(1, 100);
        pf.record_actual(1, 200);
        pf.flush(&mut s, &mut ds, &mut cfg, LOG).unwrap();

        assert_eq!(s.size("/m_nml.bin").unwrap(), size_before);
        assert_eq!(ds.num_samples(), 6);
        assert_eq!(cfg.num_samples, 6);
        // Positions 0 (label 0) and 1 (label 1) were displaced by label 1s.
        assert_eq!(cfg.samples_per_label, vec![2, 4]);
        let total: u32 = cfg.samples_per_label.iter().sum();
        assert_eq!(total, cfg.num_samples);
    }

    #[test]
    fn log_count_matches_content() {
        let (_d, mut s) = store();
        append_infer_log(&mut s, LOG, &[(1, 1), (2, 1)]).unwrap();
        append_infer_log(&mut s, LOG, &[(0, 0)]).unwrap();
        let pairs = read_infer_log(&mut s, LOG).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(s.size(LOG).unwrap(), 8 + 6);
    }

    #[test]
    fn log_never_exceeds_cap() {
        let (_d, mut s) = store();
        let batch: Vec<(u8, u8)> = (0..16).map(|i| (i as u8, i as u8)).collect();
        for _ in 0..100 {
            append_infer_log(&mut s, LOG, &batch).unwrap();
            assert!(s.size(LOG).unwrap() <= MAX_INFER_LOG_BYTES as u64);
        }
        let pairs = read_infer_log(&mut s, LOG).unwrap();
        let expected = 8 + pairs.len() as u64 * 2;
        assert_eq!(s.size(LOG).unwrap(), expected);
    }

    #[test]
    fn trim_keeps_most_recent_half_budget() {
        let (_d, mut s) = store();
        // Fill just past the budget, then push one marked batch.
        let filler: Vec<(u8, u8)> = (0..100).map(|_| (9, 9)).collect();
        for _ in 0..11 {
            append_infer_log(&mut s, LOG, &filler).unwrap();
        }
        append_infer_log(&mut s, LOG, &[(7, 7)]).unwrap();
        let pairs = read_infer_log(&mut s, LOG).unwrap();
        assert!(pairs.len() <= PAIR_BUDGET / 2 + 1);
        assert_eq!(*pairs.last().unwrap(), (7, 7));
    }

    #[test]
    fn summarize_reports_agreement() {
        let (_d, mut s) = store();
        append_infer_log(&mut s, LOG, &[(1, 1), (2, 1), (LABEL_UNKNOWN, 2)]).unwrap();
        let (count, agreement) = summarize_infer_log(&mut s, LOG).unwrap();
        assert_eq!(count, 3);
        assert!((agreement - 0.5).abs() < 1e-6);
    }
}
