use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single normalized observation from one source.
///
/// Signals are immutable once accepted by the ingestor; every downstream
/// engine consumes them by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub source_id: String,
    pub region: String,
    pub domain: String,
    pub signal_type: String,
    pub value: f64,
    /// Reporter confidence, clamped to [0, 1].
    pub confidence: f64,
    /// Observation time, epoch milliseconds.
    pub observed_at: i64,
    #[serde(default)]
    pub evidence_ids: BTreeSet<String>,
}

/// One labeler's share of a fused score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contributor {
    pub signal_type: String,
    /// Contribution on the 0..100 score scale.
    pub contribution: f64,
    /// Normalized labeler weight; weights over all labelers sum to 1.
    pub learned_weight: f64,
}

/// Fused per-source output of the weak-supervision pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedSignal {
    pub source_id: String,
    pub domain: String,
    pub region: String,
    pub probability: f64,
    /// Blended score on a 0..100 scale.
    pub score: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    /// Top contributors, sorted by descending contribution (at most 8).
    pub contributors: Vec<Contributor>,
    pub evidence_ids: BTreeSet<String>,
}

/// Severity band for a flagged anomaly, derived from the combined p-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Unspecified,
    Low,
    Medium,
    High,
}

impl Severity {
    /// Band a combined p-value that already passed the anomaly gate.
    pub fn from_p_value(p_value: f64, alpha: f64) -> Self {
        if p_value <= alpha / 5.0 {
            Severity::High
        } else if p_value <= alpha / 2.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Conformal scoring result for one signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratedAnomaly {
    pub source_id: String,
    pub domain: String,
    pub region: String,
    pub signal_type: String,
    pub value: f64,
    /// Bonferroni-combined p-value over the value and timing tests.
    pub p_value: f64,
    pub alpha: f64,
    pub legacy_z_score: f64,
    pub is_anomaly: bool,
    pub severity: Severity,
    pub calibration_count: usize,
    pub calibration_center: f64,
    pub nonconformity: f64,
    pub p_value_value: f64,
    pub p_value_timing: f64,
    pub timing_nonconformity: f64,
    /// Milliseconds since the previous observation of this metric (0 when first).
    pub interval_ms: i64,
    pub observed_at: i64,
}

/// A directed co-activation edge between two signal types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalEdge {
    pub cause: String,
    pub effect: String,
    pub support_count: usize,
    pub conditional_lift: f64,
    pub causal_score: f64,
    pub mdl_gain: f64,
    pub delay_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Success,
    Failed,
    Skipped,
    Pending,
}

/// One recorded pipeline phase. Entries reference their parents by phase
/// name, so the full trace forms a DAG rather than a linear list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTraceEntry {
    pub phase: String,
    pub status: PhaseStatus,
    pub started_at: i64,
    pub completed_at: i64,
    pub elapsed_ms: i64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub parent_phases: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// The two analysis phases the policy can order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyAction {
    #[serde(rename = "weak-supervision-fusion")]
    WeakSupervisionFusion,
    #[serde(rename = "conformal-anomaly")]
    ConformalAnomaly,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::WeakSupervisionFusion => "weak-supervision-fusion",
            PolicyAction::ConformalAnomaly => "conformal-anomaly",
        }
    }
}

/// One Q-table cell, keyed by (domain, state_hash, action).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub domain: String,
    pub state_hash: u32,
    pub action: PolicyAction,
    pub q_value: f64,
    pub visit_count: u64,
    pub last_reward: f64,
    pub last_updated: i64,
}

/// Welford running moments for one (domain, region, signal_type) metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineStats {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub std_dev: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub last_value: f64,
    pub last_updated: i64,
}

impl BaselineStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            std_dev: 0.0,
            min_value: f64::INFINITY,
            max_value: f64::NEG_INFINITY,
            last_value: 0.0,
            last_updated: 0,
        }
    }

    /// Fold one observation into the running moments.
    pub fn update(&mut self, value: f64, now: i64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.std_dev = if self.count >= 2 {
            (self.m2 / (self.count - 1) as f64).sqrt()
        } else {
            0.0
        };
        self.min_value = self.min_value.min(value);
        self.max_value = self.max_value.max(value);
        self.last_value = value;
        self.last_updated = now;
    }

    /// Z-score of `value` against the running moments (0 when degenerate).
    pub fn z_score(&self, value: f64) -> f64 {
        if self.count < 2 || self.std_dev < 1e-9 {
            return 0.0;
        }
        (value - self.mean) / self.std_dev
    }
}

impl Default for BaselineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A calibration window read from the blackboard: parallel value and
/// timestamp sequences, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationWindow {
    pub values: Vec<f64>,
    pub observed_at: Vec<i64>,
}

/// Aggregate diagnostics from the topology pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyDiagnostics {
    pub tsi: f64,
    pub beta1: usize,
    pub component_count: usize,
    pub hyperedge_count: usize,
    pub node_count: usize,
    pub edge_count: usize,
}

/// Full record of one shadow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub domain: String,
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    pub status: RunStatus,
    /// "local", "remote", or "mixed" when a worker fallback occurred.
    pub worker_mode: String,
    pub alpha: f64,
    pub signal_count: usize,
    pub fused_signals: Vec<FusedSignal>,
    pub anomalies: Vec<CalibratedAnomaly>,
    pub causal_edges: Vec<CausalEdge>,
    pub trace: Vec<PhaseTraceEntry>,
    #[serde(default)]
    pub diagnostics: TopologyDiagnostics,
    #[serde(default)]
    pub error: Option<String>,
}

/// Compact run listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub domain: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub status: RunStatus,
    pub fused_count: usize,
    pub anomaly_count: usize,
    pub anomaly_flagged_count: usize,
    pub max_fused_score: f64,
    pub min_p_value: f64,
}

impl RunRecord {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            domain: self.domain.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            status: self.status,
            fused_count: self.fused_signals.len(),
            anomaly_count: self.anomalies.len(),
            anomaly_flagged_count: self.anomalies.iter().filter(|a| a.is_anomaly).count(),
            max_fused_score: self
                .fused_signals
                .iter()
                .map(|f| f.score)
                .fold(0.0, f64::max),
            min_p_value: self
                .anomalies
                .iter()
                .map(|a| a.p_value)
                .fold(1.0, f64::min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands() {
        assert_eq!(Severity::from_p_value(0.009, 0.05), Severity::High);
        assert_eq!(Severity::from_p_value(0.02, 0.05), Severity::Medium);
        assert_eq!(Severity::from_p_value(0.04, 0.05), Severity::Low);
    }

    #[test]
    fn welford_matches_two_pass() {
        let samples = [3.0, 7.0, 7.0, 19.0, 24.0, 4.5];
        let mut baseline = BaselineStats::new();
        for (i, &s) in samples.iter().enumerate() {
            baseline.update(s, i as i64);
        }

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>()
            / (samples.len() - 1) as f64;

        assert!((baseline.mean - mean).abs() < 1e-9);
        assert!((baseline.std_dev - var.sqrt()).abs() < 1e-9);
        assert_eq!(baseline.count, 6);
        assert_eq!(baseline.min_value, 3.0);
        assert_eq!(baseline.max_value, 24.0);
        assert_eq!(baseline.last_value, 4.5);
    }

    #[test]
    fn outlier_widens_baseline_for_good() {
        let mut seeded = BaselineStats::new();
        for i in 0..6 {
            seeded.update(10.0, i);
        }

        // Updating with the mean alone barely moves the spread.
        let mut mean_only = seeded.clone();
        mean_only.update(seeded.mean, 7);

        // An outlier followed by the mean must not be forgotten.
        let mut with_outlier = seeded.clone();
        with_outlier.update(1_000.0, 7);
        let after_outlier = with_outlier.std_dev;
        with_outlier.update(seeded.mean, 8);

        assert!(after_outlier > 100.0);
        assert!(with_outlier.std_dev >= mean_only.std_dev);
        assert!(with_outlier.std_dev > 100.0);
    }

    #[test]
    fn run_summary_aggregates() {
        let run = RunRecord {
            run_id: "r1".into(),
            domain: "finance".into(),
            started_at: 0,
            completed_at: Some(10),
            status: RunStatus::Completed,
            worker_mode: "local".into(),
            alpha: 0.05,
            signal_count: 2,
            fused_signals: vec![],
            anomalies: vec![],
            causal_edges: vec![],
            trace: vec![],
            diagnostics: TopologyDiagnostics::default(),
            error: None,
        };
        let summary = run.summary();
        assert_eq!(summary.fused_count, 0);
        assert_eq!(summary.max_fused_score, 0.0);
        assert_eq!(summary.min_p_value, 1.0);
    }
}
