//! Fusion Engine (weak-supervision EM)
//!
//! Treats every signal type as a noisy labeler voting on its sources.
//! Votes are thresholded against the labeler's own value distribution, then
//! an EM loop learns per-labeler accuracies and the class prior; correlated
//! labelers are down-weighted so a clique of redundant feeds cannot shout
//! down an independent one.

use forensics_core::stats::{logit, mean, pearson, percentile_value, sigmoid};
use forensics_core::{Contributor, FusedSignal, Signal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Maximum EM iterations before giving up on convergence.
pub const MAX_ITERATIONS: usize = 80;

/// Contributors retained per fused signal.
pub const MAX_CONTRIBUTORS: usize = 8;

const ACCURACY_SEED: f64 = 0.7;
const PRIOR_SEED: f64 = 0.5;
/// Beta prior pseudo-count and mean for the accuracy M-step.
const PRIOR_STRENGTH: f64 = 6.0;
const PRIOR_MEAN: f64 = 0.55;
const MIN_DEP_OVERLAP: usize = 6;

/// Fitted model parameters, reported alongside the fused signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionModel {
    pub signal_types: Vec<String>,
    pub accuracies: Vec<f64>,
    pub weights: Vec<f64>,
    pub propensities: Vec<f64>,
    pub dependencies: Vec<f64>,
    pub class_prior: f64,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Clone)]
pub struct FusionOutput {
    pub fused: Vec<FusedSignal>,
    pub model: FusionModel,
}

struct LabelMatrix {
    sources: Vec<String>,
    types: Vec<String>,
    /// Accumulated value per (source, type); None when never observed.
    values: Vec<Vec<Option<f64>>>,
    /// Vote per (source, type): +1, -1, or 0 (abstain).
    labels: Vec<Vec<i8>>,
    thresholds: Vec<f64>,
    domains: Vec<String>,
    regions: Vec<String>,
    evidence: Vec<BTreeSet<String>>,
}

fn build_matrix(signals: &[Signal]) -> LabelMatrix {
    let mut sources: Vec<String> = Vec::new();
    let mut source_index: HashMap<String, usize> = HashMap::new();
    let mut types: Vec<String> = Vec::new();
    let mut type_index: HashMap<String, usize> = HashMap::new();

    // First pass fixes iteration order: sources and types in first-seen order.
    for signal in signals {
        source_index.entry(signal.source_id.clone()).or_insert_with(|| {
            sources.push(signal.source_id.clone());
            sources.len() - 1
        });
        type_index.entry(signal.signal_type.clone()).or_insert_with(|| {
            types.push(signal.signal_type.clone());
            types.len() - 1
        });
    }

    let n = sources.len();
    let m = types.len();
    let mut values: Vec<Vec<Option<f64>>> = vec![vec![None; m]; n];
    let mut domains = vec![String::new(); n];
    let mut regions = vec![String::new(); n];
    let mut evidence: Vec<BTreeSet<String>> = vec![BTreeSet::new(); n];

    for signal in signals {
        let i = source_index[&signal.source_id];
        let j = type_index[&signal.signal_type];
        *values[i][j].get_or_insert(0.0) += signal.value;
        if domains[i].is_empty() {
            domains[i] = signal.domain.clone();
            regions[i] = signal.region.clone();
        }
        evidence[i].extend(signal.evidence_ids.iter().cloned());
    }

    let thresholds: Vec<f64> = (0..m)
        .map(|j| {
            let positives: Vec<f64> = (0..n)
                .filter_map(|i| values[i][j])
                .filter(|v| *v > 0.0)
                .collect();
            percentile_value(&positives, 70.0)
        })
        .collect();

    let labels: Vec<Vec<i8>> = (0..n)
        .map(|i| {
            (0..m)
                .map(|j| match values[i][j] {
                    Some(v) if v >= thresholds[j] && v > 0.0 => 1,
                    Some(v) if v > 0.0 && v < thresholds[j] => -1,
                    _ => 0,
                })
                .collect()
        })
        .collect();

    LabelMatrix {
        sources,
        types,
        values,
        labels,
        thresholds,
        domains,
        regions,
        evidence,
    }
}

/// Pairwise label correlation penalty per column: overlap-weighted mean of
/// |Pearson| against every other column with at least [`MIN_DEP_OVERLAP`]
/// co-observed votes, clamped to [0, 0.95].
fn dependency_penalties(labels: &[Vec<i8>], m: usize) -> Vec<f64> {
    let n = labels.len();
    (0..m)
        .map(|j| {
            let mut weighted = 0.0;
            let mut weight_total = 0.0;
            for k in 0..m {
                if k == j {
                    continue;
                }
                let mut xs = Vec::new();
                let mut ys = Vec::new();
                for i in 0..n {
                    if labels[i][j] != 0 && labels[i][k] != 0 {
                        xs.push(labels[i][j] as f64);
                        ys.push(labels[i][k] as f64);
                    }
                }
                if xs.len() >= MIN_DEP_OVERLAP {
                    let rho = pearson(&xs, &ys).abs();
                    let overlap = xs.len() as f64;
                    weighted += rho * overlap;
                    weight_total += overlap;
                }
            }
            if weight_total > 0.0 {
                (weighted / weight_total).clamp(0.0, 0.95)
            } else {
                0.0
            }
        })
        .collect()
}

fn vote_scales(dependencies: &[f64], propensities: &[f64]) -> Vec<f64> {
    dependencies
        .iter()
        .zip(propensities.iter())
        .map(|(dep, prop)| ((1.0 - 0.7 * dep) * (0.4 + 0.6 * prop)).clamp(0.15, 1.0))
        .collect()
}

/// Posterior for one row under the current model.
fn e_step_row(labels: &[i8], accuracies: &[f64], scales: &[f64], prior: f64) -> f64 {
    let mut log_odds = logit(prior);
    for (j, &label) in labels.iter().enumerate() {
        if label == 0 {
            continue;
        }
        let a = accuracies[j];
        log_odds += label as f64 * (a / (1.0 - a)).ln() * scales[j];
    }
    sigmoid(log_odds)
}

/// Fuse a signal batch into per-source probabilities and scores.
pub fn fuse(signals: &[Signal]) -> FusionOutput {
    let matrix = build_matrix(signals);
    let n = matrix.sources.len();
    let m = matrix.types.len();

    if n == 0 || m == 0 {
        return FusionOutput {
            fused: Vec::new(),
            model: FusionModel {
                signal_types: matrix.types,
                accuracies: Vec::new(),
                weights: Vec::new(),
                propensities: Vec::new(),
                dependencies: Vec::new(),
                class_prior: PRIOR_SEED,
                iterations: 0,
                converged: true,
            },
        };
    }

    let propensities: Vec<f64> = (0..m)
        .map(|j| {
            let active = (0..n).filter(|&i| matrix.labels[i][j] != 0).count();
            active as f64 / n as f64
        })
        .collect();
    let dependencies = dependency_penalties(&matrix.labels, m);
    let scales = vote_scales(&dependencies, &propensities);

    // EM loop.
    let mut accuracies = vec![ACCURACY_SEED; m];
    let mut prior = PRIOR_SEED;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < MAX_ITERATIONS {
        iterations += 1;

        let posteriors: Vec<f64> = (0..n)
            .map(|i| e_step_row(&matrix.labels[i], &accuracies, &scales, prior))
            .collect();

        let new_prior = mean(&posteriors).clamp(0.05, 0.95);

        let mut accuracy_delta = 0.0;
        let mut new_accuracies = Vec::with_capacity(m);
        for j in 0..m {
            let mut agreement = 0.0;
            let mut active = 0usize;
            for i in 0..n {
                match matrix.labels[i][j] {
                    1 => {
                        agreement += posteriors[i];
                        active += 1;
                    }
                    -1 => {
                        agreement += 1.0 - posteriors[i];
                        active += 1;
                    }
                    _ => {}
                }
            }
            let updated = ((agreement + PRIOR_STRENGTH * PRIOR_MEAN)
                / (active as f64 + PRIOR_STRENGTH))
                .clamp(0.501, 0.999);
            accuracy_delta += (updated - accuracies[j]).abs();
            new_accuracies.push(updated);
        }

        let prior_delta = (new_prior - prior).abs();
        accuracies = new_accuracies;
        prior = new_prior;

        if accuracy_delta < 1e-5 && prior_delta < 1e-6 {
            converged = true;
            break;
        }
    }

    // Labeler weights.
    let raw_weights: Vec<f64> = (0..m)
        .map(|j| {
            (2.0 * (accuracies[j] - 0.5)).max(0.001)
                * propensities[j].max(0.02)
                * (1.0 - dependencies[j]).powf(0.8).max(0.1)
        })
        .collect();
    let weight_sum: f64 = raw_weights.iter().sum();
    let weights: Vec<f64> = if weight_sum > 0.0 {
        raw_weights.iter().map(|w| w / weight_sum).collect()
    } else {
        vec![1.0 / m as f64; m]
    };

    // Column positive-value ranges for contribution normalization.
    let ranges: Vec<(f64, f64)> = (0..m)
        .map(|j| {
            let positives: Vec<f64> = (0..n)
                .filter_map(|i| matrix.values[i][j])
                .filter(|v| *v > 0.0)
                .collect();
            if positives.is_empty() {
                (0.0, 0.0)
            } else {
                let min = positives.iter().copied().fold(f64::INFINITY, f64::min);
                let max = positives.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (min, max)
            }
        })
        .collect();

    let mut fused: Vec<FusedSignal> = (0..n)
        .map(|i| {
            let probability = e_step_row(&matrix.labels[i], &accuracies, &scales, prior);

            let mut contributors: Vec<Contributor> = Vec::new();
            let mut contribution_sum = 0.0;
            let mut active_vote_scale = 0.0;
            for j in 0..m {
                if matrix.labels[i][j] == 0 {
                    continue;
                }
                active_vote_scale += scales[j];
                let value = matrix.values[i][j].unwrap_or(0.0);
                let (min, max) = ranges[j];
                let normalized = if max - min > 1e-12 {
                    ((value - min) / (max - min)).clamp(0.0, 1.0)
                } else if value > 0.0 {
                    1.0
                } else {
                    0.0
                };
                let contribution = normalized * weights[j] * 100.0;
                contribution_sum += contribution;
                contributors.push(Contributor {
                    signal_type: matrix.types[j].clone(),
                    contribution,
                    learned_weight: weights[j],
                });
            }

            contributors.sort_by(|a, b| {
                b.contribution
                    .partial_cmp(&a.contribution)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.signal_type.cmp(&b.signal_type))
            });
            contributors.truncate(MAX_CONTRIBUTORS);

            let score =
                (0.7 * probability * 100.0 + 0.3 * contribution_sum).clamp(0.0, 100.0);

            let margin = 1.96
                * (probability * (1.0 - probability) / (2.0 * active_vote_scale).max(1.0))
                    .sqrt();

            FusedSignal {
                source_id: matrix.sources[i].clone(),
                domain: matrix.domains[i].clone(),
                region: matrix.regions[i].clone(),
                probability,
                score,
                confidence_lower: (probability - margin).clamp(0.0, 1.0),
                confidence_upper: (probability + margin).clamp(0.0, 1.0),
                contributors,
                evidence_ids: matrix.evidence[i].clone(),
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });

    tracing::debug!(
        sources = n,
        labelers = m,
        iterations,
        converged,
        class_prior = prior,
        "weak-supervision fusion complete"
    );

    FusionOutput {
        fused,
        model: FusionModel {
            signal_types: matrix.types,
            accuracies,
            weights,
            propensities,
            dependencies,
            class_prior: prior,
            iterations,
            converged,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(source: &str, signal_type: &str, value: f64) -> Signal {
        Signal {
            source_id: source.to_string(),
            region: "global".to_string(),
            domain: "finance".to_string(),
            signal_type: signal_type.to_string(),
            value,
            confidence: 1.0,
            observed_at: 1_000,
            evidence_ids: BTreeSet::new(),
        }
    }

    /// Twelve sources voting through three labelers: six clearly above the
    /// activation threshold, six clearly below.
    fn discrimination_batch() -> Vec<Signal> {
        let mut signals = Vec::new();
        for i in 0..12 {
            let value = if i < 6 { 100.0 } else { 10.0 };
            for t in ["alpha", "beta", "gamma"] {
                signals.push(signal(&format!("s{i}"), t, value));
            }
        }
        signals
    }

    #[test]
    fn em_separates_strong_and_weak_sources() {
        let out = fuse(&discrimination_batch());
        assert_eq!(out.fused.len(), 12);

        let p = |source: &str| {
            out.fused
                .iter()
                .find(|f| f.source_id == source)
                .unwrap()
                .probability
        };
        let strong: Vec<f64> = (0..6).map(|i| p(&format!("s{i}"))).collect();
        let weak: Vec<f64> = (6..12).map(|i| p(&format!("s{i}"))).collect();

        assert!(mean(&strong) > 0.52, "strong mean {}", mean(&strong));
        assert!(mean(&weak) < 0.48, "weak mean {}", mean(&weak));
        for s in &strong {
            for w in &weak {
                assert!(s > w, "expected strict ordering: {s} vs {w}");
            }
        }

        // Strong sources rank first by score.
        let strong_ids: Vec<String> = (0..6).map(|i| format!("s{i}")).collect();
        for fused in out.fused.iter().take(6) {
            assert!(strong_ids.contains(&fused.source_id));
        }
        assert!(out.fused[0].score > out.fused[11].score);
    }

    #[test]
    fn weights_normalize_to_one() {
        let out = fuse(&discrimination_batch());
        let total: f64 = out.model.weights.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(out.model.weights.iter().all(|w| *w > 0.0));
    }

    #[test]
    fn confidence_interval_brackets_probability() {
        let out = fuse(&discrimination_batch());
        for fused in &out.fused {
            assert!(fused.confidence_lower >= 0.0);
            assert!(fused.confidence_lower <= fused.probability);
            assert!(fused.probability <= fused.confidence_upper);
            assert!(fused.confidence_upper <= 1.0);
            assert!(fused.score >= 0.0 && fused.score <= 100.0);
        }
    }

    #[test]
    fn more_positive_votes_cannot_lower_probability() {
        let accuracies = vec![0.8, 0.7, 0.65];
        let scales = vec![1.0, 0.8, 0.6];
        let two_votes = e_step_row(&[1, 1, 0], &accuracies, &scales, 0.5);
        let three_votes = e_step_row(&[1, 1, 1], &accuracies, &scales, 0.5);
        assert!(three_votes >= two_votes);

        let with_negative = e_step_row(&[1, 1, -1], &accuracies, &scales, 0.5);
        assert!(with_negative <= two_votes);
    }

    #[test]
    fn correlated_labelers_are_penalized() {
        let out = fuse(&discrimination_batch());
        // All three labelers vote identically, so dependency is at the cap.
        for dep in &out.model.dependencies {
            assert!((*dep - 0.95).abs() < 1e-9);
        }
    }

    #[test]
    fn contributors_sorted_and_capped() {
        let mut signals = Vec::new();
        for t in 0..10 {
            for i in 0..8 {
                let value = (i + 1) as f64 * (t + 1) as f64;
                signals.push(signal(&format!("s{i}"), &format!("type{t}"), value));
            }
        }
        let out = fuse(&signals);
        for fused in &out.fused {
            assert!(fused.contributors.len() <= MAX_CONTRIBUTORS);
            for pair in fused.contributors.windows(2) {
                assert!(pair[0].contribution >= pair[1].contribution);
            }
        }
    }

    #[test]
    fn evidence_ids_survive_fusion() {
        let mut a = signal("s0", "alpha", 50.0);
        a.evidence_ids.insert("ev-1".to_string());
        let mut b = signal("s0", "beta", 60.0);
        b.evidence_ids.insert("ev-2".to_string());
        let out = fuse(&[a, b]);
        let fused = &out.fused[0];
        assert!(fused.evidence_ids.contains("ev-1"));
        assert!(fused.evidence_ids.contains("ev-2"));
    }

    #[test]
    fn empty_batch_fuses_to_nothing() {
        let out = fuse(&[]);
        assert!(out.fused.is_empty());
        assert!(out.model.converged);
    }

    #[test]
    fn deterministic_across_invocations() {
        let batch = discrimination_batch();
        let a = fuse(&batch);
        let b = fuse(&batch);
        for (x, y) in a.fused.iter().zip(b.fused.iter()) {
            assert_eq!(x.source_id, y.source_id);
            assert_eq!(x.probability.to_bits(), y.probability.to_bits());
            assert_eq!(x.score.to_bits(), y.score.to_bits());
        }
    }
}
