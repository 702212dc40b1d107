//! Anomaly Engine (split-conformal, dual nonconformity)
//!
//! Each signal is scored against the calibration history of its
//! `(domain, signal_type, region)` metric: one nonconformity over the value
//! (distance from the calibration median) and one over arrival timing
//! (distance from the typical log-interval). The two p-values combine by
//! Bonferroni, which keeps the per-signal type-I guarantee at alpha without
//! assuming anything about the underlying distributions.
//!
//! History is consulted before the new observation is appended, so the
//! first value of any metric can never be flagged.

use blackboard::Blackboard;
use forensics_core::stats::median;
use forensics_core::{CalibratedAnomaly, CalibrationWindow, Severity, Signal};
use statrs::statistics::Statistics;

/// Minimum calibration count before a signal may be flagged.
pub const MIN_CALIBRATION: usize = 8;

struct ConformalScores {
    center: f64,
    nonconformity: f64,
    p_value_value: f64,
    p_value_timing: f64,
    timing_nonconformity: f64,
    interval_ms: i64,
}

fn log_interval(delta_ms: i64) -> f64 {
    (delta_ms.max(0) as f64).ln_1p()
}

fn conformal_scores(window: &CalibrationWindow, value: f64, observed_at: i64) -> ConformalScores {
    let values = &window.values;
    let (center, nonconformity, p_value_value) = if values.is_empty() {
        (0.0, 0.0, 1.0)
    } else {
        let center = median(values);
        let ncm = (value - center).abs();
        let at_least = values.iter().filter(|h| (*h - center).abs() >= ncm).count();
        (center, ncm, (at_least + 1) as f64 / (values.len() + 1) as f64)
    };

    let timestamps = &window.observed_at;
    let intervals: Vec<f64> = timestamps
        .windows(2)
        .map(|w| log_interval(w[1] - w[0]))
        .collect();

    let last = timestamps.last().copied();
    let interval_ms = last.map(|l| (observed_at - l).max(0)).unwrap_or(0);

    let (p_value_timing, timing_nonconformity) = match last {
        Some(l) if !intervals.is_empty() && observed_at > l => {
            let interval_median = median(&intervals);
            let ncm_t = (log_interval(observed_at - l) - interval_median).abs();
            let at_least = intervals
                .iter()
                .filter(|i| (*i - interval_median).abs() >= ncm_t)
                .count();
            (
                (at_least + 1) as f64 / (intervals.len() + 1) as f64,
                ncm_t,
            )
        }
        _ => (1.0, 0.0),
    };

    ConformalScores {
        center,
        nonconformity,
        p_value_value,
        p_value_timing,
        timing_nonconformity,
        interval_ms,
    }
}

fn legacy_z(window: &CalibrationWindow, value: f64) -> f64 {
    if window.values.len() < 2 {
        return 0.0;
    }
    let mean = window.values.as_slice().mean();
    let std_dev = window.values.as_slice().std_dev();
    if std_dev < 1e-9 {
        return 0.0;
    }
    (value - mean) / std_dev
}

/// Score one signal against its calibration window. Pure; the caller owns
/// the append.
pub fn score_signal(signal: &Signal, alpha: f64, window: &CalibrationWindow) -> CalibratedAnomaly {
    let scores = conformal_scores(window, signal.value, signal.observed_at);
    let p_combined = (2.0 * scores.p_value_value.min(scores.p_value_timing)).min(1.0);
    let calibration_count = window.values.len();
    let is_anomaly = calibration_count >= MIN_CALIBRATION && p_combined <= alpha;
    let severity = if is_anomaly {
        Severity::from_p_value(p_combined, alpha)
    } else {
        Severity::Unspecified
    };

    CalibratedAnomaly {
        source_id: signal.source_id.clone(),
        domain: signal.domain.clone(),
        region: signal.region.clone(),
        signal_type: signal.signal_type.clone(),
        value: signal.value,
        p_value: p_combined,
        alpha,
        legacy_z_score: legacy_z(window, signal.value),
        is_anomaly,
        severity,
        calibration_count,
        calibration_center: scores.center,
        nonconformity: scores.nonconformity,
        p_value_value: scores.p_value_value,
        p_value_timing: scores.p_value_timing,
        timing_nonconformity: scores.timing_nonconformity,
        interval_ms: scores.interval_ms,
        observed_at: signal.observed_at,
    }
}

/// Score an enriched batch against the blackboard's calibration history,
/// appending each observation after it is scored. Results come back sorted
/// by ascending combined p-value.
pub async fn score_batch(
    signals: &[Signal],
    alpha: f64,
    board: &Blackboard,
) -> Vec<CalibratedAnomaly> {
    let mut anomalies = Vec::with_capacity(signals.len());
    for signal in signals {
        let window = board
            .fetch_calibration(&signal.domain, &signal.signal_type, &signal.region)
            .await;
        let anomaly = score_signal(signal, alpha, &window);
        if anomaly.is_anomaly {
            tracing::debug!(
                source_id = %signal.source_id,
                signal_type = %signal.signal_type,
                p_value = anomaly.p_value,
                severity = ?anomaly.severity,
                "conformal anomaly flagged"
            );
        }
        board
            .append_calibration(
                &signal.domain,
                &signal.signal_type,
                &signal.region,
                signal.value,
                signal.observed_at,
            )
            .await;
        anomalies.push(anomaly);
    }

    anomalies.sort_by(|a, b| {
        a.p_value
            .partial_cmp(&b.p_value)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    anomalies
}
