//! Confusion bookkeeping and the combined training score.
//!
//! The scorer tallies per-label true/false positives and false negatives.
//! Abstentions (either side 255) never enter the tallies; a prediction below
//! the certainty threshold is not a wrong prediction, it is no prediction.

use crate::config::MetricMask;
use crate::LABEL_UNKNOWN;

#[derive(Debug, Clone)]
pub struct Scorer {
    tp: Vec<u32>,
    fp: Vec<u32>,
    fn_: Vec<u32>,
    total: u32,
    correct: u32,
}

impl Scorer {
    pub fn new(num_labels: u8) -> Self {
        let n = num_labels as usize;
        Scorer {
            tp: vec![0; n],
            fp: vec![0; n],
            fn_: vec![0; n],
            total: 0,
            correct: 0,
        }
    }

    pub fn record(&mut self, predicted: u8, actual: u8) {
        if predicted == LABEL_UNKNOWN || actual == LABEL_UNKNOWN {
            return;
        }
        let (p, a) = (predicted as usize, actual as usize);
        if p >= self.tp.len() || a >= self.tp.len() {
            return;
        }
        self.total += 1;
        if p == a {
            self.correct += 1;
            self.tp[a] += 1;
        } else {
            self.fp[p] += 1;
            self.fn_[a] += 1;
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f32 / self.total as f32
    }

    pub fn precision(&self, label: u8) -> f32 {
        let l = label as usize;
        ratio(self.tp[l], self.tp[l] + self.fp[l])
    }

    pub fn recall(&self, label: u8) -> f32 {
        let l = label as usize;
        ratio(self.tp[l], self.tp[l] + self.fn_[l])
    }

    pub fn f1(&self, label: u8) -> f32 {
        let p = self.precision(label);
        let r = self.recall(label);
        if p + r == 0.0 {
            return 0.0;
        }
        2.0 * p * r / (p + r)
    }

    /// Macro average over labels that occur in the ground truth.
    fn macro_over(&self, metric: impl Fn(u8) -> f32) -> f32 {
        let mut sum = 0.0;
        let mut n = 0u32;
        for l in 0..self.tp.len() {
            if self.tp[l] + self.fn_[l] == 0 {
                continue;
            }
            sum += metric(l as u8);
            n += 1;
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f32
        }
    }

    pub fn macro_precision(&self) -> f32 {
        self.macro_over(|l| self.precision(l))
    }

    pub fn macro_recall(&self) -> f32 {
        self.macro_over(|l| self.recall(l))
    }

    pub fn macro_f1(&self) -> f32 {
        self.macro_over(|l| self.f1(l))
    }

    /// Mean of the enabled metrics.
    pub fn metric_mean(&self, mask: MetricMask) -> f32 {
        let mut sum = 0.0;
        let mut n = 0u32;
        if mask.contains(MetricMask::ACCURACY) {
            sum += self.accuracy();
            n += 1;
        }
        if mask.contains(MetricMask::PRECISION) {
            sum += self.macro_precision();
            n += 1;
        }
        if mask.contains(MetricMask::RECALL) {
            sum += self.macro_recall();
            n += 1;
        }
        if mask.contains(MetricMask::F1) {
            sum += self.macro_f1();
            n += 1;
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f32
        }
    }
}

fn ratio(num: u32, den: u32) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

/// Weighted blend of the out-of-bag and validation scores. Without a
/// validation score the OOB score stands alone.
pub fn combined_score(oob: f32, valid: Option<f32>, combine_ratio: f32) -> f32 {
    match valid {
        Some(v) => oob * (1.0 - combine_ratio) + v * combine_ratio,
        None => oob,
    }
}
