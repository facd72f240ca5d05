//! Raw labelled CSV -> engine artifacts.
//!
//! Input rows are `label,v1,v2,...` with a consistent width. Ingestion
//! derives a categorizer table (discrete features where a column holds at
//! most four integral values, quartile edges otherwise, with identical edge
//! patterns shared), quantizes every row through the engine's own
//! categorizer, and materializes the binary dataset, data-params file, and a
//! default configuration.

use std::collections::BTreeSet;
use std::path::Path;

use color_eyre::eyre::{bail, Context};
use color_eyre::Result;

use embedded_rfengine::categorizer::Categorizer;
use embedded_rfengine::config::Config;
use embedded_rfengine::dataset::{Dataset, Sample};
use embedded_rfengine::resources::{
    ResourceIndex, SUFFIX_BASE_DATA, SUFFIX_CATEGORIZER, SUFFIX_CONFIG, SUFFIX_DATA_PARAMS,
};
use embedded_rfengine::store::{ObjectStore, OpenMode};

const SCALE_FACTOR: i32 = 100;
const GROUPS_PER_FEATURE: usize = 4;

#[derive(Debug)]
pub struct RawDataset {
    pub feature_count: usize,
    pub rows: Vec<(String, Vec<f32>)>,
}

impl RawDataset {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path.as_ref())
            .context("could not open raw data file")?;
        let mut rows: Vec<(String, Vec<f32>)> = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let label = record
                .get(0)
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_owned);
            let Some(label) = label else {
                bail!("row {} has no label", rows.len() + 1);
            };
            let mut values = Vec::with_capacity(record.len().saturating_sub(1));
            for field in record.iter().skip(1) {
                values.push(
                    field
                        .trim()
                        .parse::<f32>()
                        .with_context(|| format!("bad value {field:?} in row {}", rows.len() + 1))?,
                );
            }
            rows.push((label, values));
        }
        if rows.is_empty() {
            bail!("raw data file holds no rows");
        }
        let feature_count = rows[0].1.len();
        if feature_count == 0 {
            bail!("raw data rows hold no features");
        }
        if rows.iter().any(|(_, v)| v.len() != feature_count) {
            bail!("raw data rows have inconsistent widths");
        }
        Ok(RawDataset {
            feature_count,
            rows,
        })
    }

    /// Label names in first-appearance order; this order fixes the ids.
    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (label, _) in &self.rows {
            if !names.contains(label) {
                names.push(label.clone());
            }
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ColumnPlan {
    DiscreteFull,
    DiscreteCustom(Vec<i32>),
    Continuous(Vec<i32>),
}

fn plan_column(values: &[f32]) -> ColumnPlan {
    let mut integral = true;
    let mut distinct: BTreeSet<i32> = BTreeSet::new();
    for &v in values {
        if v.fract() != 0.0 || !(-1e6..=1e6).contains(&v) {
            integral = false;
            break;
        }
        distinct.insert(v as i32);
    }
    if integral && distinct.len() <= GROUPS_PER_FEATURE {
        let full_range = distinct
            .iter()
            .all(|&v| (0..GROUPS_PER_FEATURE as i32).contains(&v));
        if full_range {
            return ColumnPlan::DiscreteFull;
        }
        return ColumnPlan::DiscreteCustom(distinct.into_iter().collect());
    }

    // Quartile edges over the sorted column, scaled to integers; duplicate
    // edges are nudged so the thresholds stay strictly increasing.
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut edges = Vec::with_capacity(GROUPS_PER_FEATURE - 1);
    for k in 1..GROUPS_PER_FEATURE {
        let at = (k * sorted.len() / GROUPS_PER_FEATURE).min(sorted.len() - 1);
        let mut edge = (sorted[at] * SCALE_FACTOR as f32).round() as i32;
        if let Some(&prev) = edges.last() {
            if edge <= prev {
                edge = prev + 1;
            }
        }
        edges.push(edge);
    }
    ColumnPlan::Continuous(edges)
}

/// Render the `CTG2` table for this dataset.
pub fn derive_table(raw: &RawDataset) -> Result<String> {
    use std::fmt::Write;

    let labels = raw.label_names();
    if labels.len() > 255 {
        bail!("too many labels ({})", labels.len());
    }
    let plans: Vec<ColumnPlan> = (0..raw.feature_count)
        .map(|j| {
            let column: Vec<f32> = raw.rows.iter().map(|(_, v)| v[j]).collect();
            plan_column(&column)
        })
        .collect();

    // Edge patterns used by more than one feature move into the shared pool.
    let mut patterns: Vec<Vec<i32>> = Vec::new();
    for plan in &plans {
        if let ColumnPlan::Continuous(edges) = plan {
            let uses = plans
                .iter()
                .filter(|p| matches!(p, ColumnPlan::Continuous(e) if e == edges))
                .count();
            if uses >= 2 && !patterns.contains(edges) {
                patterns.push(edges.clone());
            }
        }
    }

    let mut out = String::new();
    writeln!(
        out,
        "CTG2,{},{},{},{},{}",
        raw.feature_count,
        GROUPS_PER_FEATURE,
        labels.len(),
        patterns.len(),
        SCALE_FACTOR
    )?;
    for (id, name) in labels.iter().enumerate() {
        writeln!(out, "L,{id},{name}")?;
    }
    for (id, edges) in patterns.iter().enumerate() {
        write!(out, "P,{id},{}", edges.len())?;
        for e in edges {
            write!(out, ",{e}")?;
        }
        writeln!(out)?;
    }
    for plan in &plans {
        match plan {
            ColumnPlan::DiscreteFull => writeln!(out, "DF")?,
            ColumnPlan::DiscreteCustom(values) => {
                write!(out, "DC,{}", values.len())?;
                for v in values {
                    write!(out, ",{v}")?;
                }
                writeln!(out)?;
            }
            ColumnPlan::Continuous(edges) => {
                if let Some(id) = patterns.iter().position(|p| p == edges) {
                    writeln!(out, "CS,{id}")?;
                } else {
                    write!(out, "CU,{}", edges.len())?;
                    for e in edges {
                        write!(out, ",{e}")?;
                    }
                    writeln!(out)?;
                }
            }
        }
    }
    Ok(out)
}

/// Write the categorizer, binary dataset, data-params, and default config
/// for `model`, returning the loaded categorizer.
pub fn write_model_artifacts<S: ObjectStore>(
    store: &mut S,
    model: &str,
    raw: &RawDataset,
) -> Result<Categorizer> {
    use std::io::Write;

    let rindex = ResourceIndex::new(model)?;
    let table = derive_table(raw)?;
    let ctg_path = rindex.path(SUFFIX_CATEGORIZER)?;
    {
        let mut f = store.open(&ctg_path, OpenMode::Write)?;
        f.write_all(table.as_bytes())?;
    }
    let ctg = Categorizer::load(store, &ctg_path).context("generated table did not parse")?;

    let mut data = Dataset::init(&rindex.path(SUFFIX_BASE_DATA)?, ctg.num_features())?;
    data.begin_empty()?;
    let mut samples_per_label = vec![0u32; ctg.num_labels() as usize];
    for (label, values) in &raw.rows {
        let id = ctg.normalized_label(label);
        if id == embedded_rfengine::LABEL_UNKNOWN {
            bail!("label {label:?} missing from generated table");
        }
        data.push_sample(&Sample {
            label: id,
            features: ctg.categorize_sample(values),
        })?;
        samples_per_label[id as usize] += 1;
    }
    data.release(store, false)?;

    let mut cfg = Config::default();
    cfg.num_samples = raw.rows.len() as u32;
    cfg.num_features = ctg.num_features();
    cfg.num_labels = ctg.num_labels();
    cfg.samples_per_label = samples_per_label;
    cfg.auto_configure();
    cfg.normalize_ratios();
    cfg.save_json(store, &rindex.path(SUFFIX_CONFIG)?)?;
    cfg.save_data_params(store, &rindex.path(SUFFIX_DATA_PARAMS)?)?;
    Ok(ctg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_rfengine::store::DirStore;
    use std::io::Write;

    fn raw() -> RawDataset {
        // Column 0: small integers (discrete full range). Column 1: custom
        // discrete values. Columns 2 and 3: identical continuous spreads.
        let mut rows = Vec::new();
        for i in 0..16 {
            let label = if i < 8 { "low" } else { "high" };
            let x = (i % 4) as f32;
            let c = if i % 2 == 0 { 10.0 } else { 20.0 };
            let spread = i as f32 * 1.5;
            rows.push((label.to_string(), vec![x, c, spread, spread]));
        }
        RawDataset {
            feature_count: 4,
            rows,
        }
    }

    #[test]
    fn table_derivation_covers_all_ref_kinds() {
        let table = derive_table(&raw()).unwrap();
        assert!(table.starts_with("CTG2,4,4,2,1,100"));
        assert!(table.contains("\nDF\n"));
        assert!(table.contains("\nDC,2,10,20\n"));
        // The two identical spread columns share one pattern.
        assert_eq!(table.matches("CS,0").count(), 2);
        assert!(table.contains("\nP,0,3,"));
    }

    #[test]
    fn artifacts_parse_and_quantize() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirStore::new(dir.path());
        let ctg = write_model_artifacts(&mut store, "bench", &raw()).unwrap();
        assert_eq!(ctg.num_labels(), 2);
        assert!(store.exists("/bench_nml.bin"));
        assert!(store.exists("/bench_ctg.csv"));
        assert!(store.exists("/bench_dp.csv"));
        assert!(store.exists("/bench_config.json"));

        let mut data = Dataset::init("/bench_nml.bin", 4).unwrap();
        data.load(&mut store).unwrap();
        assert_eq!(data.num_samples(), 16);
    }

    #[test]
    fn inconsistent_rows_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "a,1,2").unwrap();
        writeln!(f, "b,1").unwrap();
        drop(f);
        assert!(RawDataset::read(&path).is_err());
    }
}
