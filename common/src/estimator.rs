//! Reduction of a batch of noisy samples to one representative value.
//!
//! Two strategies are available and chosen per sensor through
//! [`EstimatorStrategy`]. They are never blended.

use serde::{Deserialize, Serialize};

use crate::config::SensorConfig;

/// Below this absolute batch mean the relative-deviation test is meaningless,
/// so outlier rejection is skipped.
pub const MEAN_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorStrategy {
    /// Reject outliers against the batch mean, then take the most frequent
    /// (optionally rounded) value, falling back to the mean of the survivors.
    #[default]
    ModeWithOutlierFilter,
    /// Pick the sample with the smallest summed distance to all others.
    MinAbsoluteDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateMethod {
    Empty,
    Mode,
    MeanFallback,
    MinAbsoluteDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub value: Option<f64>,
    pub method: EstimateMethod,
    pub kept: usize,
    pub discarded: usize,
}

impl Estimate {
    fn empty(discarded: usize) -> Self {
        Self {
            value: None,
            method: EstimateMethod::Empty,
            kept: 0,
            discarded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustEstimator {
    strategy: EstimatorStrategy,
    outlier_fraction: f64,
    rounding_precision: Option<u32>,
}

#[derive(Debug, Clone)]
struct Bucket {
    label: f64,
    members: Vec<f64>,
}

impl RobustEstimator {
    pub fn new(
        strategy: EstimatorStrategy,
        outlier_fraction: f64,
        rounding_precision: Option<u32>,
    ) -> Self {
        Self {
            strategy,
            outlier_fraction,
            rounding_precision,
        }
    }

    pub fn from_config(config: &SensorConfig) -> Self {
        Self::new(
            config.strategy,
            config.outlier_fraction,
            config.rounding_precision,
        )
    }

    pub fn estimate(&self, samples: &[f64]) -> Estimate {
        if samples.is_empty() {
            return Estimate::empty(0);
        }

        match self.strategy {
            EstimatorStrategy::ModeWithOutlierFilter => self.mode_with_filter(samples),
            EstimatorStrategy::MinAbsoluteDeviation => Estimate {
                value: min_absolute_deviation(samples),
                method: EstimateMethod::MinAbsoluteDeviation,
                kept: samples.len(),
                discarded: 0,
            },
        }
    }

    fn mode_with_filter(&self, samples: &[f64]) -> Estimate {
        let survivors = self.reject_outliers(samples);
        let discarded = samples.len() - survivors.len();

        if survivors.is_empty() {
            return Estimate::empty(discarded);
        }

        let buckets = self.bucketize(&survivors);
        let max_count = buckets.iter().map(|b| b.members.len()).max().unwrap_or(0);

        if max_count <= 1 && survivors.len() > 1 {
            return Estimate {
                value: mean(&survivors),
                method: EstimateMethod::MeanFallback,
                kept: survivors.len(),
                discarded,
            };
        }

        let winner = buckets
            .iter()
            .filter(|b| b.members.len() == max_count)
            .min_by(|a, b| a.label.total_cmp(&b.label));

        Estimate {
            value: winner.and_then(|b| mean(&b.members)),
            method: EstimateMethod::Mode,
            kept: survivors.len(),
            discarded,
        }
    }

    /// Repeatedly drops the single sample deviating most from the current
    /// mean until every survivor is within `outlier_fraction` of it.
    fn reject_outliers(&self, samples: &[f64]) -> Vec<f64> {
        let mut survivors = samples.to_vec();
        if self.outlier_fraction <= 0.0 {
            return survivors;
        }

        while survivors.len() > 1 {
            let Some(center) = mean(&survivors) else {
                break;
            };
            if center.abs() < MEAN_EPSILON {
                break;
            }

            let worst = survivors
                .iter()
                .enumerate()
                .map(|(idx, value)| (idx, ((value - center) / center).abs()))
                .max_by(|a, b| a.1.total_cmp(&b.1));

            match worst {
                Some((idx, deviation)) if deviation > self.outlier_fraction => {
                    let dropped = survivors.remove(idx);
                    log::debug!(
                        "discarding outlier {dropped} (mean {center:.2}, deviation {:.1}%)",
                        deviation * 100.0
                    );
                }
                _ => break,
            }
        }

        survivors
    }

    fn bucketize(&self, values: &[f64]) -> Vec<Bucket> {
        let mut buckets: Vec<Bucket> = Vec::with_capacity(values.len());

        for &value in values {
            let label = self.bucket_label(value);
            match buckets.iter_mut().find(|b| b.label == label) {
                Some(bucket) => bucket.members.push(value),
                None => buckets.push(Bucket {
                    label,
                    members: vec![value],
                }),
            }
        }

        buckets
    }

    fn bucket_label(&self, value: f64) -> f64 {
        match self.rounding_precision {
            Some(precision) => {
                let scale = 10_f64.powi(precision as i32);
                // Integer key first so float noise cannot split a bucket.
                let key = (value * scale).round() as i64;
                key as f64 / scale
            }
            None => value,
        }
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let count = values.len() as f64;
    let total: f64 = values.iter().sum();
    if total.is_finite() {
        return Some(total / count);
    }
    // Sum overflowed; scale each term first.
    Some(values.iter().map(|value| value / count).sum())
}

/// The sample whose summed absolute distance to every other sample is
/// smallest. Ties go to the smaller sample.
pub fn min_absolute_deviation(values: &[f64]) -> Option<f64> {
    values
        .iter()
        .map(|&candidate| {
            let cost: f64 = values.iter().map(|&other| (candidate - other).abs()).sum();
            (candidate, cost)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.total_cmp(&b.0)))
        .map(|(candidate, _)| candidate)
}
