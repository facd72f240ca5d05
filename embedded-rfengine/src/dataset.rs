//! Chunked packed sample container and its on-disk binary form.
//!
//! On disk: `[num_samples u32][num_features u16]` followed by fixed-size
//! records of one label byte plus `ceil(num_features / 4)` packed feature
//! bytes, little-endian throughout. In memory the samples live in a sequence
//! of packed chunks so loading needs neither per-sample heap headers nor one
//! contiguous multi-kilobyte allocation.

use std::io::{Seek, SeekFrom, Write};

use crate::packed::PackedVec2;
use crate::store::{read_exact_or_truncated, ObjectStore, OpenMode};
use crate::{
    Error, Result, MAX_DATASET_BYTES, MAX_FILE_PATH, MAX_NUM_FEATURES, MAX_NUM_SAMPLES,
};

pub const HEADER_BYTES: usize = 6;
pub const DEFAULT_CHUNK_BYTES: usize = 8192;
const MAX_BATCH_BYTES: usize = 2048;

/// One labelled, quantized feature vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub label: u8,
    pub features: PackedVec2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetState {
    /// Path and geometry known; nothing in RAM.
    Initialized,
    /// Chunks and labels populated; random access available.
    Loaded,
    /// RAM dropped, file intact.
    Released,
    /// RAM dropped, file removed.
    Purged,
}

/// Result of [`Dataset::append`]. `displaced` is populated only in
/// ring-overwrite mode and lists the labels that were replaced, in the order
/// they previously occupied the head of the file.
#[derive(Debug, Default)]
pub struct AppendOutcome {
    pub accepted: usize,
    pub displaced: Vec<u8>,
}

#[derive(Debug)]
pub struct Dataset {
    path: heapless::String<MAX_FILE_PATH>,
    num_features: u16,
    num_samples: u32,
    max_chunk_bytes: usize,
    state: DatasetState,
    labels: Vec<u8>,
    chunks: Vec<PackedVec2>,
}

impl Dataset {
    /// Bind a path and geometry. Does not touch storage. A `num_features` of
    /// 0 means "adopt the geometry from the file header on first load".
    pub fn init(path: &str, num_features: u16) -> Result<Self> {
        if num_features > MAX_NUM_FEATURES {
            return Err(Error::CapacityExceeded);
        }
        let mut p = heapless::String::new();
        p.push_str(path).map_err(|_| Error::CapacityExceeded)?;
        Ok(Dataset {
            path: p,
            num_features,
            num_samples: 0,
            max_chunk_bytes: DEFAULT_CHUNK_BYTES,
            state: DatasetState::Initialized,
            labels: Vec::new(),
            chunks: Vec::new(),
        })
    }

    /// Override the chunk allocation quantum (tests use tiny chunks to force
    /// multi-chunk layouts).
    pub fn with_chunk_bytes(mut self, max_chunk_bytes: usize) -> Self {
        self.max_chunk_bytes = max_chunk_bytes.max(1);
        self
    }

    pub fn state(&self) -> DatasetState {
        self.state
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) -> Result<()> {
        let mut p = heapless::String::new();
        p.push_str(path).map_err(|_| Error::CapacityExceeded)?;
        self.path = p;
        Ok(())
    }

    pub fn num_samples(&self) -> u32 {
        self.num_samples
    }

    pub fn num_features(&self) -> u16 {
        self.num_features
    }

    pub fn record_size(&self) -> usize {
        1 + (self.num_features as usize).div_ceil(4)
    }

    pub fn samples_per_chunk(&self) -> usize {
        let bits_per_sample = 2 * self.num_features.max(1) as usize;
        ((8 * self.max_chunk_bytes) / bits_per_sample).max(1)
    }

    /// Reset to an empty in-RAM dataset so samples can be pushed before the
    /// first release. Requires known geometry.
    pub fn begin_empty(&mut self) -> Result<()> {
        if self.num_features == 0 {
            return Err(Error::HeaderMismatch);
        }
        self.labels.clear();
        self.chunks.clear();
        self.num_samples = 0;
        self.state = DatasetState::Loaded;
        Ok(())
    }

    /// Append one sample to RAM. Storage caps are enforced here so a later
    /// release cannot overrun the dataset budget.
    pub fn push_sample(&mut self, sample: &Sample) -> Result<()> {
        if self.state != DatasetState::Loaded {
            return Err(Error::NotLoaded);
        }
        if sample.features.len() != self.num_features as usize {
            return Err(Error::HeaderMismatch);
        }
        if self.num_samples >= self.file_sample_capacity() {
            return Err(Error::CapacityExceeded);
        }
        self.push_values(sample.label, |j| sample.features.get(j));
        Ok(())
    }

    fn push_values(&mut self, label: u8, feature: impl Fn(usize) -> u8) {
        let spc = self.samples_per_chunk();
        let nf = self.num_features as usize;
        let i = self.num_samples as usize;
        if self.chunks.len() <= i / spc {
            self.chunks.push(PackedVec2::with_capacity(spc * nf));
        }
        let chunk = &mut self.chunks[i / spc];
        for j in 0..nf {
            chunk.push_back(feature(j));
        }
        self.labels.push(label);
        self.num_samples += 1;
    }

    /// Constant-time label access; 0 when out of range or not loaded.
    pub fn get_label(&self, i: usize) -> u8 {
        if self.state != DatasetState::Loaded || i >= self.num_samples as usize {
            return 0;
        }
        self.labels[i]
    }

    /// Constant-time feature access; 0 when out of range or not loaded.
    pub fn get_feature(&self, i: usize, j: usize) -> u8 {
        if self.state != DatasetState::Loaded
            || i >= self.num_samples as usize
            || j >= self.num_features as usize
        {
            return 0;
        }
        let spc = self.samples_per_chunk();
        self.chunks[i / spc].get((i % spc) * self.num_features as usize + j)
    }

    /// Copy out sample `i`'s feature vector.
    pub fn features_of(&self, i: usize) -> PackedVec2 {
        let nf = self.num_features as usize;
        let mut v = PackedVec2::with_capacity(nf);
        for j in 0..nf {
            v.push_back(self.get_feature(i, j));
        }
        v
    }

    /// Per-label sample counts over the loaded content.
    pub fn label_histogram(&self) -> Vec<u32> {
        let mut counts = Vec::new();
        for &label in &self.labels {
            if counts.len() <= label as usize {
                counts.resize(label as usize + 1, 0);
            }
            counts[label as usize] += 1;
        }
        counts
    }

    fn file_sample_capacity(&self) -> u32 {
        let by_budget = (MAX_DATASET_BYTES as usize - HEADER_BYTES) / self.record_size();
        MAX_NUM_SAMPLES.min(by_budget as u32)
    }

    /// Read only the header of the dataset behind `path`.
    pub fn peek_header<S: ObjectStore>(store: &mut S, path: &str) -> Result<(u32, u16)> {
        let mut f = store.open(path, OpenMode::Read)?;
        let mut hdr = [0u8; HEADER_BYTES];
        read_exact_or_truncated(&mut f, &mut hdr)?;
        let n = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let nf = u16::from_le_bytes([hdr[4], hdr[5]]);
        Ok((n, nf))
    }

    /// Populate RAM from the file, decoding records in batches of at most
    /// 2 kB through one scratch buffer.
    pub fn load<S: ObjectStore>(&mut self, store: &mut S) -> Result<()> {
        let mut f = store.open(&self.path, OpenMode::Read)?;
        let mut hdr = [0u8; HEADER_BYTES];
        read_exact_or_truncated(&mut f, &mut hdr)?;
        let n = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let nf = u16::from_le_bytes([hdr[4], hdr[5]]);
        if nf == 0 || nf > MAX_NUM_FEATURES {
            return Err(Error::HeaderMismatch);
        }
        if self.num_features == 0 {
            self.num_features = nf;
        } else if nf != self.num_features {
            return Err(Error::HeaderMismatch);
        }
        if n > MAX_NUM_SAMPLES {
            return Err(Error::CapacityExceeded);
        }
        let rec = self.record_size();
        if (HEADER_BYTES + n as usize * rec) as u32 > MAX_DATASET_BYTES {
            return Err(Error::CapacityExceeded);
        }

        self.begin_empty()?;
        let records_per_batch = MAX_BATCH_BYTES / rec;
        if records_per_batch == 0 {
            // Record wider than the scratch budget: scalar fallback.
            let mut record = vec![0u8; rec];
            for _ in 0..n {
                read_exact_or_truncated(&mut f, &mut record)?;
                self.push_record(&record);
            }
        } else {
            let mut scratch = vec![0u8; records_per_batch * rec];
            let mut remaining = n as usize;
            while remaining > 0 {
                let take = remaining.min(records_per_batch);
                read_exact_or_truncated(&mut f, &mut scratch[..take * rec])?;
                for r in 0..take {
                    let record = &scratch[r * rec..(r + 1) * rec];
                    self.push_record(record);
                }
                remaining -= take;
            }
        }
        log::debug!("dataset {}: loaded {} samples", self.path, self.num_samples);
        Ok(())
    }

    fn push_record(&mut self, record: &[u8]) {
        let body = &record[1..];
        self.push_values(record[0], |j| (body[j / 4] >> (2 * (j % 4))) & 0b11);
    }

    fn encode_record(&self, i: usize, out: &mut [u8]) {
        out.fill(0);
        out[0] = self.labels[i];
        for j in 0..self.num_features as usize {
            out[1 + j / 4] |= self.get_feature(i, j) << (2 * (j % 4));
        }
    }

    /// Drop RAM. With `keep_file = false` the current in-memory content is
    /// first persisted back (this is also how a dataset built in RAM is
    /// materialized the first time).
    pub fn release<S: ObjectStore>(&mut self, store: &mut S, keep_file: bool) -> Result<()> {
        if !keep_file {
            if self.state != DatasetState::Loaded {
                return Err(Error::NotLoaded);
            }
            self.write_file(store)?;
        }
        self.drop_memory();
        self.state = DatasetState::Released;
        Ok(())
    }

    fn drop_memory(&mut self) {
        self.labels = Vec::new();
        self.chunks = Vec::new();
    }

    fn write_file<S: ObjectStore>(&mut self, store: &mut S) -> Result<()> {
        let rec = self.record_size();
        let total = (HEADER_BYTES + self.num_samples as usize * rec) as u64;
        if store.free_space() < total {
            return Err(Error::InsufficientStorage);
        }
        let result = self.write_records(store, rec);
        if result.is_err() {
            // Never leave a half-written dataset behind.
            if let Err(e) = store.remove(&self.path) {
                log::warn!("dataset {}: cleanup after failed write: {e}", self.path);
            }
        }
        result
    }

    fn write_records<S: ObjectStore>(&mut self, store: &mut S, rec: usize) -> Result<()> {
        let mut f = store.open(&self.path, OpenMode::Write)?;
        let mut hdr = [0u8; HEADER_BYTES];
        hdr[..4].copy_from_slice(&self.num_samples.to_le_bytes());
        hdr[4..].copy_from_slice(&self.num_features.to_le_bytes());
        f.write_all(&hdr)?;

        let per_batch = (MAX_BATCH_BYTES / rec).max(1);
        let mut buf = vec![0u8; per_batch * rec];
        let mut i = 0usize;
        while i < self.num_samples as usize {
            let take = per_batch.min(self.num_samples as usize - i);
            for r in 0..take {
                let (lo, hi) = (r * rec, (r + 1) * rec);
                self.encode_record(i + r, &mut buf[lo..hi]);
            }
            f.write_all(&buf[..take * rec])?;
            i += take;
        }
        f.flush()?;
        Ok(())
    }

    /// Drop RAM and delete the file. Removal failures are logged, not
    /// propagated.
    pub fn purge<S: ObjectStore>(&mut self, store: &mut S) {
        self.drop_memory();
        if store.exists(&self.path) {
            if let Err(e) = store.remove(&self.path) {
                log::warn!("dataset {}: purge failed: {e}", self.path);
            }
        }
        self.state = DatasetState::Purged;
    }

    /// Populate this dataset with the records of `source` selected by `ids`
    /// (ascending), read straight from `source`'s file. With `save_ram` the
    /// source's RAM is released for the duration; its loaded state is
    /// restored before returning.
    pub fn load_subset<S: ObjectStore>(
        &mut self,
        store: &mut S,
        source: &mut Dataset,
        ids: &[u16],
        save_ram: bool,
    ) -> Result<()> {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids must ascend");
        if self.num_features == 0 {
            self.num_features = source.num_features;
        }
        if self.num_features != source.num_features {
            return Err(Error::HeaderMismatch);
        }
        let was_loaded = source.state == DatasetState::Loaded;
        if save_ram && was_loaded {
            source.release(store, true)?;
        }
        let copied = self.copy_ids(store, source.path(), ids);
        if save_ram && was_loaded {
            let restored = source.load(store);
            copied?;
            return restored;
        }
        copied
    }

    fn copy_ids<S: ObjectStore>(&mut self, store: &mut S, from: &str, ids: &[u16]) -> Result<()> {
        let mut f = store.open(from, OpenMode::Read)?;
        let mut hdr = [0u8; HEADER_BYTES];
        read_exact_or_truncated(&mut f, &mut hdr)?;
        let n = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let nf = u16::from_le_bytes([hdr[4], hdr[5]]);
        if nf != self.num_features {
            return Err(Error::HeaderMismatch);
        }
        let rec = self.record_size();
        let mut record = vec![0u8; rec];
        self.begin_empty()?;
        for &id in ids {
            if id as u32 >= n {
                return Err(Error::CapacityExceeded);
            }
            f.seek(SeekFrom::Start((HEADER_BYTES + id as usize * rec) as u64))?;
            read_exact_or_truncated(&mut f, &mut record)?;
            self.push_record(&record);
        }
        Ok(())
    }

    /// Load the contiguous sample range making up `chunk_index` of `source`.
    pub fn load_chunk<S: ObjectStore>(
        &mut self,
        store: &mut S,
        source: &mut Dataset,
        chunk_index: usize,
        save_ram: bool,
    ) -> Result<()> {
        let spc = source.samples_per_chunk();
        let begin = chunk_index * spc;
        let end = (begin + spc).min(source.num_samples as usize);
        if begin >= end {
            return Err(Error::CapacityExceeded);
        }
        let ids: Vec<u16> = (begin..end).map(|i| i as u16).collect();
        self.load_subset(store, source, &ids, save_ram)
    }

    /// Write `samples` into the file. `extend = true` appends past the end
    /// and grows `num_samples` (capped at the platform maxima and the dataset
    /// byte budget). `extend = false` rewrites records from the start of the
    /// file without changing its size, returning the labels that were
    /// overwritten so per-label counters can be decremented.
    pub fn append<S: ObjectStore>(
        &mut self,
        store: &mut S,
        samples: &[Sample],
        extend: bool,
    ) -> Result<AppendOutcome> {
        if self.state == DatasetState::Purged {
            return Err(Error::NotLoaded);
        }
        let nf = self.num_features as usize;
        if nf == 0 || samples.iter().any(|s| s.features.len() != nf) {
            return Err(Error::HeaderMismatch);
        }
        let rec = self.record_size();
        let mut f = store.open(&self.path, OpenMode::ReadWrite)?;

        let mut hdr = [0u8; HEADER_BYTES];
        let fresh = f.seek(SeekFrom::End(0))? == 0;
        let mut n = if fresh {
            0
        } else {
            f.seek(SeekFrom::Start(0))?;
            read_exact_or_truncated(&mut f, &mut hdr)?;
            let nf_file = u16::from_le_bytes([hdr[4], hdr[5]]);
            if nf_file != self.num_features {
                return Err(Error::HeaderMismatch);
            }
            u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]])
        };

        let mut outcome = AppendOutcome::default();
        let mut record = vec![0u8; rec];
        if extend {
            let capacity = self.file_sample_capacity();
            let accept = samples.len().min(capacity.saturating_sub(n) as usize);
            if accept < samples.len() {
                log::warn!(
                    "dataset {}: capped append at {accept} of {} samples",
                    self.path,
                    samples.len()
                );
            }
            f.seek(SeekFrom::Start((HEADER_BYTES + n as usize * rec) as u64))?;
            for sample in &samples[..accept] {
                encode_sample(sample, nf, &mut record);
                f.write_all(&record)?;
            }
            n += accept as u32;
            hdr[..4].copy_from_slice(&n.to_le_bytes());
            hdr[4..].copy_from_slice(&self.num_features.to_le_bytes());
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&hdr)?;
            f.flush()?;
            if self.state == DatasetState::Loaded {
                for sample in &samples[..accept] {
                    self.push_values(sample.label, |j| sample.features.get(j));
                }
            } else {
                self.num_samples = n;
            }
            outcome.accepted = accept;
        } else {
            let accept = samples.len().min(n as usize);
            for (k, sample) in samples[..accept].iter().enumerate() {
                let pos = (HEADER_BYTES + k * rec) as u64;
                f.seek(SeekFrom::Start(pos))?;
                let mut old = [0u8; 1];
                read_exact_or_truncated(&mut f, &mut old)?;
                outcome.displaced.push(old[0]);
                encode_sample(sample, nf, &mut record);
                f.seek(SeekFrom::Start(pos))?;
                f.write_all(&record)?;
            }
            f.flush()?;
            if self.state == DatasetState::Loaded {
                for (k, sample) in samples[..accept].iter().enumerate() {
                    self.labels[k] = sample.label;
                    let spc = self.samples_per_chunk();
                    let base = (k % spc) * nf;
                    for j in 0..nf {
                        self.chunks[k / spc].set(base + j, sample.features.get(j));
                    }
                }
            }
            outcome.accepted = accept;
        }
        Ok(outcome)
    }
}

fn encode_sample(sample: &Sample, num_features: usize, out: &mut [u8]) {
    out.fill(0);
    out[0] = sample.label;
    for j in 0..num_features {
        out[1 + j / 4] |= sample.features.get(j) << (2 * (j % 4));
    }
}
