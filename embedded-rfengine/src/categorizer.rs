//! Feature-to-bin mapping table.
//!
//! The categorizer turns a real-valued feature vector into the 2-bit bin
//! indices the trees split on. Its table is a versioned textual artifact
//! (`CTG2` header) holding a label name map, a pool of threshold patterns
//! shared between features, and one compact [`FeatureRef`] per feature.
//! Label names stay out of the hot path: everything past the public
//! prediction boundary works on `u8` ids.

use crate::packed::PackedVec2;
use crate::store::{read_all, ObjectStore};
use crate::{Error, Result, LABEL_UNKNOWN, MAX_LABELS, MAX_NUM_FEATURES};

pub const TABLE_MAGIC: &str = "CTG2";
/// Pattern ids and pooled counts must fit the 6-bit aux field.
const MAX_AUX: usize = 63;
/// Pool offsets are 8 bits.
const MAX_POOL: usize = 256;

/// Compact 16-bit binning descriptor: bits 14-15 carry the type tag, bits
/// 8-13 an auxiliary count or pattern id, bits 0-7 an offset into the
/// discrete-value or unique-edge pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureRef(u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    /// Discrete over the full bin range: clamp `floor(x)`.
    DiscreteFull,
    /// Discrete over listed raw values: position in the pooled list.
    DiscreteCustom { count: u8, offset: u8 },
    /// Continuous against a shared threshold pattern.
    ContinuousShared { pattern: u8 },
    /// Continuous against thresholds stored inline for this feature.
    ContinuousUnique { count: u8, offset: u8 },
}

impl FeatureRef {
    const TAG_DF: u16 = 0;
    const TAG_DC: u16 = 1;
    const TAG_CS: u16 = 2;
    const TAG_CU: u16 = 3;

    fn pack(tag: u16, aux: u8, offset: u8) -> Self {
        FeatureRef((tag << 14) | ((aux as u16 & 0x3F) << 8) | offset as u16)
    }

    pub fn discrete_full() -> Self {
        Self::pack(Self::TAG_DF, 0, 0)
    }

    pub fn discrete_custom(count: u8, offset: u8) -> Self {
        Self::pack(Self::TAG_DC, count, offset)
    }

    pub fn continuous_shared(pattern: u8) -> Self {
        Self::pack(Self::TAG_CS, pattern, 0)
    }

    pub fn continuous_unique(count: u8, offset: u8) -> Self {
        Self::pack(Self::TAG_CU, count, offset)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn kind(&self) -> FeatureKind {
        let aux = ((self.0 >> 8) & 0x3F) as u8;
        let offset = (self.0 & 0xFF) as u8;
        match self.0 >> 14 {
            Self::TAG_DF => FeatureKind::DiscreteFull,
            Self::TAG_DC => FeatureKind::DiscreteCustom { count: aux, offset },
            Self::TAG_CS => FeatureKind::ContinuousShared { pattern: aux },
            _ => FeatureKind::ContinuousUnique { count: aux, offset },
        }
    }
}

#[derive(Debug)]
pub struct Categorizer {
    num_features: u16,
    groups_per_feature: u8,
    scale_factor: f32,
    labels: Vec<String>,
    patterns: Vec<Vec<i32>>,
    refs: Vec<FeatureRef>,
    discrete_pool: Vec<i32>,
    edge_pool: Vec<i32>,
}

impl Categorizer {
    pub fn load<S: ObjectStore>(store: &mut S, path: &str) -> Result<Self> {
        let bytes = read_all(store, path)?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);
        let mut records = rdr.records();

        let header = next_row(&mut records)?;
        if field(&header, 0)? != TABLE_MAGIC {
            return Err(Error::HeaderMismatch);
        }
        let num_features: u16 = parse_field(&header, 1)?;
        let groups_per_feature: u8 = parse_field(&header, 2)?;
        let num_labels: usize = parse_field(&header, 3)?;
        let num_patterns: usize = parse_field(&header, 4)?;
        let scale_factor: f32 = parse_field(&header, 5)?;
        if num_features == 0
            || num_features > MAX_NUM_FEATURES
            || !(2..=4).contains(&groups_per_feature)
            || num_labels == 0
            || num_labels > MAX_LABELS
            || num_patterns > MAX_AUX + 1
            || !(scale_factor > 0.0)
        {
            return Err(Error::MalformedTable);
        }

        let mut labels: Vec<Option<String>> = vec![None; num_labels];
        for _ in 0..num_labels {
            let row = next_row(&mut records)?;
            if field(&row, 0)? != "L" {
                return Err(Error::MalformedTable);
            }
            let id: usize = parse_field(&row, 1)?;
            let name = field(&row, 2)?.to_owned();
            if id >= num_labels || name.is_empty() || labels[id].is_some() {
                return Err(Error::MalformedTable);
            }
            labels[id] = Some(name);
        }
        let labels: Vec<String> = labels.into_iter().map(|l| l.unwrap_or_default()).collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Err(Error::MalformedTable);
        }

        let edges_per_pattern = groups_per_feature as usize - 1;
        let mut patterns: Vec<Vec<i32>> = vec![Vec::new(); num_patterns];
        for _ in 0..num_patterns {
            let row = next_row(&mut records)?;
            if field(&row, 0)? != "P" {
                return Err(Error::MalformedTable);
            }
            let id: usize = parse_field(&row, 1)?;
            let count: usize = parse_field(&row, 2)?;
            if id >= num_patterns || count != edges_per_pattern || row.len() != 3 + count {
                return Err(Error::MalformedTable);
            }
            let mut edges = Vec::with_capacity(count);
            for k in 0..count {
                edges.push(parse_field(&row, 3 + k)?);
            }
            patterns[id] = edges;
        }
        if patterns.iter().any(|p| p.is_empty()) {
            return Err(Error::MalformedTable);
        }

        let mut refs = Vec::with_capacity(num_features as usize);
        let mut discrete_pool = Vec::new();
        let mut edge_pool = Vec::new();
        for _ in 0..num_features {
            let row = next_row(&mut records)?;
            let fref = match field(&row, 0)? {
                "DF" => {
                    if row.len() != 1 {
                        return Err(Error::MalformedTable);
                    }
                    FeatureRef::discrete_full()
                }
                "DC" => {
                    let count: usize = parse_field(&row, 1)?;
                    if count == 0
                        || count > groups_per_feature as usize
                        || row.len() != 2 + count
                        || discrete_pool.len() + count > MAX_POOL
                    {
                        return Err(Error::MalformedTable);
                    }
                    let offset = discrete_pool.len() as u8;
                    for k in 0..count {
                        discrete_pool.push(parse_field(&row, 2 + k)?);
                    }
                    FeatureRef::discrete_custom(count as u8, offset)
                }
                "CS" => {
                    let pattern: usize = parse_field(&row, 1)?;
                    if row.len() != 2 || pattern >= num_patterns {
                        return Err(Error::MalformedTable);
                    }
                    FeatureRef::continuous_shared(pattern as u8)
                }
                "CU" => {
                    let count: usize = parse_field(&row, 1)?;
                    if count == 0
                        || count > edges_per_pattern
                        || row.len() != 2 + count
                        || edge_pool.len() + count > MAX_POOL
                    {
                        return Err(Error::MalformedTable);
                    }
                    let offset = edge_pool.len() as u8;
                    for k in 0..count {
                        edge_pool.push(parse_field(&row, 2 + k)?);
                    }
                    FeatureRef::continuous_unique(count as u8, offset)
                }
                _ => return Err(Error::MalformedTable),
            };
            refs.push(fref);
        }
        if records.next().is_some() {
            return Err(Error::MalformedTable);
        }

        Ok(Categorizer {
            num_features,
            groups_per_feature,
            scale_factor,
            labels,
            patterns,
            refs,
            discrete_pool,
            edge_pool,
        })
    }

    pub fn num_features(&self) -> u16 {
        self.num_features
    }

    pub fn num_labels(&self) -> u8 {
        self.labels.len() as u8
    }

    pub fn groups_per_feature(&self) -> u8 {
        self.groups_per_feature
    }

    pub fn feature_ref(&self, j: usize) -> Option<FeatureRef> {
        self.refs.get(j).copied()
    }

    /// Bin a single raw value for feature `j`.
    pub fn categorize_feature(&self, j: usize, x: f32) -> u8 {
        let Some(fref) = self.refs.get(j) else {
            return 0;
        };
        if !x.is_finite() {
            return 0;
        }
        let top = self.groups_per_feature - 1;
        match fref.kind() {
            FeatureKind::DiscreteFull => (x.floor().max(0.0) as i64).min(top as i64) as u8,
            FeatureKind::DiscreteCustom { count, offset } => {
                let v = x.floor() as i32;
                let pool = &self.discrete_pool[offset as usize..offset as usize + count as usize];
                pool.iter().position(|&p| p == v).unwrap_or(0) as u8
            }
            FeatureKind::ContinuousShared { pattern } => {
                bin_scaled(self.scaled(x), &self.patterns[pattern as usize])
            }
            FeatureKind::ContinuousUnique { count, offset } => {
                let edges = &self.edge_pool[offset as usize..offset as usize + count as usize];
                bin_scaled(self.scaled(x), edges)
            }
        }
    }

    fn scaled(&self, x: f32) -> i32 {
        (x * self.scale_factor).round() as i32
    }

    /// Vectorize a full sample; missing trailing values bin as 0.
    pub fn categorize_sample(&self, xs: &[f32]) -> PackedVec2 {
        let mut packed = PackedVec2::with_capacity(self.num_features as usize);
        for j in 0..self.num_features as usize {
            let x = xs.get(j).copied().unwrap_or(0.0);
            packed.push_back(self.categorize_feature(j, x));
        }
        packed
    }

    /// Original label name for a normalized id.
    pub fn original_label(&self, id: u8) -> Option<&str> {
        self.labels.get(id as usize).map(String::as_str)
    }

    /// Normalized id for an original name; 255 when unknown.
    pub fn normalized_label(&self, name: &str) -> u8 {
        self.labels
            .iter()
            .position(|l| l == name)
            .map(|i| i as u8)
            .unwrap_or(LABEL_UNKNOWN)
    }
}

/// First bin whose threshold is strictly greater than `scaled`, or the last
/// bin when none is.
fn bin_scaled(scaled: i32, edges: &[i32]) -> u8 {
    edges
        .iter()
        .position(|&e| e > scaled)
        .unwrap_or(edges.len()) as u8
}

fn next_row(
    records: &mut csv::StringRecordsIter<'_, &[u8]>,
) -> Result<csv::StringRecord> {
    match records.next() {
        Some(Ok(row)) => Ok(row),
        Some(Err(_)) | None => Err(Error::MalformedTable),
    }
}

fn field<'r>(row: &'r csv::StringRecord, i: usize) -> Result<&'r str> {
    row.get(i).map(str::trim).ok_or(Error::MalformedTable)
}

fn parse_field<T: core::str::FromStr>(row: &csv::StringRecord, i: usize) -> Result<T> {
    field(row, i)?.parse().map_err(|_| Error::MalformedTable)
}
