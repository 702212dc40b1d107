//! Causal Discoverer
//!
//! Buckets the batch into 30-minute windows and scans ordered signal-type
//! pairs for lagged co-activation. Lift is measured against a baseline
//! adjusted for the lookback width (the chance of hitting the effect type
//! anywhere in the window by accident), and edges are scored by an
//! MDL-weighted gain squashed through a sigmoid. Synchronous co-firing in
//! the same bucket is deliberately not evidence.

use forensics_core::stats::{median, percentile_value, sigmoid};
use forensics_core::{CausalEdge, Signal};
use std::collections::{BTreeSet, HashMap};

pub const BUCKET_MS: i64 = 30 * 60 * 1000;
pub const LOOKBACK_BUCKETS: i64 = 8;
pub const MIN_SUPPORT: usize = 4;
pub const MIN_CAUSAL_SCORE: f64 = 0.15;
pub const MAX_EDGES: usize = 40;

const MIN_SIGNALS: usize = 8;
const MIN_TYPES: usize = 3;

struct TypeActivation {
    signal_type: String,
    active_buckets: BTreeSet<i64>,
    baseline: f64,
}

fn activations(signals: &[Signal]) -> (Vec<TypeActivation>, i64) {
    let mut order: Vec<String> = Vec::new();
    let mut by_type: HashMap<String, Vec<(i64, f64)>> = HashMap::new();

    let min_bucket = signals
        .iter()
        .map(|s| s.observed_at.div_euclid(BUCKET_MS))
        .min()
        .unwrap_or(0);
    let max_bucket = signals
        .iter()
        .map(|s| s.observed_at.div_euclid(BUCKET_MS))
        .max()
        .unwrap_or(0);
    let total_buckets = max_bucket - min_bucket + 1;

    for signal in signals {
        let bucket = signal.observed_at.div_euclid(BUCKET_MS) - min_bucket;
        by_type
            .entry(signal.signal_type.clone())
            .or_insert_with(|| {
                order.push(signal.signal_type.clone());
                Vec::new()
            })
            .push((bucket, signal.value));
    }

    let activations = order
        .into_iter()
        .map(|signal_type| {
            let observations = &by_type[&signal_type];
            let positives: Vec<f64> = observations
                .iter()
                .map(|(_, v)| *v)
                .filter(|v| *v > 0.0)
                .collect();
            let threshold = percentile_value(&positives, 70.0);
            let active_buckets: BTreeSet<i64> = observations
                .iter()
                .filter(|(_, v)| *v >= threshold && *v > 0.0)
                .map(|(bucket, _)| *bucket)
                .collect();
            let baseline = active_buckets.len() as f64 / total_buckets as f64;
            TypeActivation {
                signal_type,
                active_buckets,
                baseline,
            }
        })
        .collect();

    (activations, total_buckets)
}

/// Discover lag-windowed causal edges over the batch. Returns at most
/// [`MAX_EDGES`] edges sorted by descending score; bails out to empty below
/// 8 signals or 3 distinct types.
pub fn discover(signals: &[Signal]) -> Vec<CausalEdge> {
    if signals.len() < MIN_SIGNALS {
        return Vec::new();
    }
    let (activations, total_buckets) = activations(signals);
    if activations.len() < MIN_TYPES {
        return Vec::new();
    }

    let mut edges: Vec<CausalEdge> = Vec::new();

    for cause in &activations {
        if cause.active_buckets.is_empty() {
            continue;
        }
        for effect in &activations {
            if cause.signal_type == effect.signal_type {
                continue;
            }

            let mut coactivations = 0usize;
            let mut offsets: Vec<f64> = Vec::new();
            for &a in &cause.active_buckets {
                // One count per cause bucket: the first effect activation
                // inside the lookback window wins.
                for b in (a + 1)..=(a + LOOKBACK_BUCKETS) {
                    if effect.active_buckets.contains(&b) {
                        coactivations += 1;
                        offsets.push((b - a) as f64);
                        break;
                    }
                }
            }

            if coactivations < MIN_SUPPORT {
                continue;
            }

            let p_effect_given_cause = coactivations as f64 / cause.active_buckets.len() as f64;
            let adj_baseline = (1.0 - (1.0 - effect.baseline).powi(LOOKBACK_BUCKETS as i32))
                .clamp(1e-9, 1.0);
            let lift = p_effect_given_cause / adj_baseline;
            if lift <= 1.0 {
                continue;
            }

            let mdl_gain = lift * lift.log2() * (coactivations as f64 / total_buckets as f64);
            let score = sigmoid(2.0 * mdl_gain - 1.0);
            if score < MIN_CAUSAL_SCORE {
                continue;
            }

            let delay_ms = median(&offsets).round() as i64 * BUCKET_MS;

            edges.push(CausalEdge {
                cause: cause.signal_type.clone(),
                effect: effect.signal_type.clone(),
                support_count: coactivations,
                conditional_lift: lift,
                causal_score: score,
                mdl_gain,
                delay_ms,
            });
        }
    }

    edges.sort_by(|a, b| {
        b.causal_score
            .partial_cmp(&a.causal_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (a.cause.as_str(), a.effect.as_str()).cmp(&(b.cause.as_str(), b.effect.as_str())))
    });
    edges.truncate(MAX_EDGES);

    tracing::debug!(edges = edges.len(), "causal discovery complete");
    edges
}
