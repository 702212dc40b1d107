use crate::filter::is_financial;
use crate::graph::{
    build_nodes, distance_matrix, node_metrics, similarity_matrix, TopologyNode,
};
use crate::homology::{persistence_pairs, totals};
use crate::hyperedge::{self, participating_nodes};
use blackboard::Blackboard;
use forensics_core::{BaselineStats, Signal, TopologyDiagnostics};
use std::collections::{BTreeSet, HashMap};

/// Cap on derived signals returned per run.
pub const MAX_DERIVED_SIGNALS: usize = 80;

/// Node signals emitted per run, ranked by risk.
pub const MAX_NODE_SIGNALS: usize = 24;

/// Regions emitted as cycle-risk signals per run.
pub const MAX_REGION_SIGNALS: usize = 6;

const MIN_NODES: usize = 4;

/// Signal types tracked against rolling baselines.
const BASELINED_TYPES: &[&str] = &["topology_tsi", "topology_beta1", "topology_cycle_risk"];

#[derive(Debug, Clone, Default)]
pub struct TopologyDerivation {
    pub signals: Vec<Signal>,
    pub diagnostics: TopologyDiagnostics,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TopologyDeriver;

impl TopologyDeriver {
    pub fn new() -> Self {
        Self
    }

    /// Derive topology signals for the financial slice of a batch, consult
    /// and update the per-metric baselines, and return the deduplicated
    /// derived signals plus run diagnostics.
    pub async fn derive(
        &self,
        domain: &str,
        signals: &[Signal],
        board: &Blackboard,
        now: i64,
    ) -> TopologyDerivation {
        let financial: Vec<&Signal> = signals.iter().filter(|s| is_financial(s)).collect();
        let nodes = build_nodes(&financial);
        if nodes.len() < MIN_NODES {
            tracing::debug!(
                domain,
                node_count = nodes.len(),
                "too few financial nodes for topology"
            );
            return TopologyDerivation::default();
        }

        let similarities = similarity_matrix(&nodes);
        let distances = distance_matrix(&similarities);
        let pairs = persistence_pairs(&distances);
        let persistence = totals(&pairs);

        let n = nodes.len();
        let h0_norm = persistence.total_h0 / ((n - 1) as f64).max(1.0);
        let h1_norm = persistence.total_h1 / (n as f64 / 2.0).max(1.0);
        let tsi = (h0_norm * 40.0 + h1_norm * 60.0).clamp(0.0, 100.0);

        let (metrics, edge_count) = node_metrics(&similarities);
        let hyperedges = hyperedge::enumerate(&nodes, &similarities);

        let diagnostics = TopologyDiagnostics {
            tsi,
            beta1: persistence.beta1,
            component_count: persistence.component_count,
            hyperedge_count: hyperedges.len(),
            node_count: n,
            edge_count,
        };

        let latest = nodes.iter().map(|node| node.observed_at).max().unwrap_or(now);
        let mean_confidence =
            nodes.iter().map(|node| node.confidence).sum::<f64>() / n as f64;

        let mut derived: Vec<Signal> = Vec::new();
        let global = |source_id: String, signal_type: &str, value: f64| Signal {
            source_id,
            region: "global".to_string(),
            domain: domain.to_string(),
            signal_type: signal_type.to_string(),
            value,
            confidence: mean_confidence.clamp(0.0, 1.0),
            observed_at: latest,
            evidence_ids: BTreeSet::new(),
        };

        derived.push(global(
            format!("topology:tsi:{domain}"),
            "topology_tsi",
            tsi,
        ));
        derived.push(global(
            format!("topology:beta1:{domain}"),
            "topology_beta1",
            persistence.beta1 as f64,
        ));

        // Per-node risk ranking.
        let max_degree = metrics
            .iter()
            .map(|m| m.degree_strength)
            .fold(0.0, f64::max);
        let max_cycle = metrics.iter().map(|m| m.cycle_strength).fold(0.0, f64::max);

        struct RankedNode<'a> {
            node: &'a TopologyNode,
            degree_norm: f64,
            cycle_norm: f64,
            cycle_count: usize,
            risk: f64,
        }

        let mut ranked: Vec<RankedNode> = nodes
            .iter()
            .zip(metrics.iter())
            .map(|(node, m)| {
                let degree_norm = if max_degree > 0.0 {
                    m.degree_strength / max_degree
                } else {
                    0.0
                };
                let cycle_norm = if max_cycle > 0.0 {
                    m.cycle_strength / max_cycle
                } else {
                    0.0
                };
                RankedNode {
                    node,
                    degree_norm,
                    cycle_norm,
                    cycle_count: m.cycle_count,
                    risk: 55.0 * degree_norm + 45.0 * cycle_norm,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.risk
                .partial_cmp(&a.risk)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node.source_id.cmp(&b.node.source_id))
        });

        for entry in ranked.iter().take(MAX_NODE_SIGNALS) {
            if entry.degree_norm > 0.15 {
                derived.push(Signal {
                    source_id: entry.node.source_id.clone(),
                    region: entry.node.region.clone(),
                    domain: domain.to_string(),
                    signal_type: "topology_degree_centrality".to_string(),
                    value: (entry.degree_norm * 100.0).clamp(0.0, 100.0),
                    confidence: entry.node.confidence.clamp(0.0, 1.0),
                    observed_at: entry.node.observed_at,
                    evidence_ids: BTreeSet::new(),
                });
            }
            if entry.cycle_norm > 0.1 || entry.cycle_count > 0 {
                derived.push(Signal {
                    source_id: entry.node.source_id.clone(),
                    region: entry.node.region.clone(),
                    domain: domain.to_string(),
                    signal_type: "topology_cycle_membership".to_string(),
                    value: (entry.cycle_norm * 100.0).clamp(0.0, 100.0),
                    confidence: entry.node.confidence.clamp(0.0, 1.0),
                    observed_at: entry.node.observed_at,
                    evidence_ids: BTreeSet::new(),
                });
            }
        }

        // Regional aggregation of node risk.
        let mut region_risks: HashMap<String, Vec<f64>> = HashMap::new();
        for entry in &ranked {
            region_risks
                .entry(entry.node.region.clone())
                .or_default()
                .push(entry.risk);
        }
        let mut regions: Vec<(String, f64)> = region_risks
            .into_iter()
            .map(|(region, risks)| {
                let mean = risks.iter().sum::<f64>() / risks.len() as f64;
                (region, mean.clamp(0.0, 100.0))
            })
            .filter(|(_, risk)| *risk >= 10.0)
            .collect();
        regions.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        for (region, risk) in regions.into_iter().take(MAX_REGION_SIGNALS) {
            derived.push(Signal {
                source_id: format!("topology:cycle:{region}"),
                region,
                domain: domain.to_string(),
                signal_type: "topology_cycle_risk".to_string(),
                value: risk,
                confidence: mean_confidence.clamp(0.0, 1.0),
                observed_at: latest,
                evidence_ids: BTreeSet::new(),
            });
        }

        if !hyperedges.is_empty() {
            let participants = participating_nodes(&hyperedges);
            let density = participants.len() as f64 / n as f64 * 100.0;
            let mean_sim = hyperedges
                .iter()
                .map(|h| h.mean_similarity)
                .sum::<f64>()
                / hyperedges.len() as f64;
            derived.push(global(
                format!("topology:hyperedge:{domain}"),
                "topology_hyperedge_density",
                density.clamp(0.0, 100.0),
            ));
            derived.push(global(
                format!("topology:sync:{domain}"),
                "topology_cross_domain_sync",
                (mean_sim * 100.0).clamp(0.0, 100.0),
            ));
        }

        let deltas = self.baseline_deltas(domain, &derived, board, now).await;
        derived.extend(deltas);

        TopologyDerivation {
            signals: dedup_signals(derived),
            diagnostics,
        }
    }

    /// Compare baselined topology metrics against their rolling moments,
    /// emit a `_baseline_delta` signal on significant drift, then fold the
    /// new observation into the baseline.
    async fn baseline_deltas(
        &self,
        domain: &str,
        derived: &[Signal],
        board: &Blackboard,
        now: i64,
    ) -> Vec<Signal> {
        let mut deltas = Vec::new();
        for signal in derived {
            if !BASELINED_TYPES.contains(&signal.signal_type.as_str()) {
                continue;
            }
            let mut stats = board
                .read_baseline(domain, &signal.region, &signal.signal_type)
                .await
                .unwrap_or_else(BaselineStats::new);

            if stats.count >= 6 {
                let z = stats.z_score(signal.value);
                if z.abs() > 0.25 {
                    deltas.push(Signal {
                        source_id: signal.source_id.clone(),
                        region: signal.region.clone(),
                        domain: domain.to_string(),
                        signal_type: format!("{}_baseline_delta", signal.signal_type),
                        value: (z.abs() * 12.0).clamp(0.0, 100.0),
                        confidence: signal.confidence,
                        observed_at: signal.observed_at,
                        evidence_ids: BTreeSet::new(),
                    });
                }
            }

            stats.update(signal.value, now);
            board
                .write_baseline(domain, &signal.region, &signal.signal_type, stats)
                .await;
        }
        deltas
    }
}

/// Keep at most [`MAX_DERIVED_SIGNALS`] signals; when two share
/// `(source_id, signal_type, region)` the higher value wins. Emission order
/// is preserved for the survivors.
fn dedup_signals(signals: Vec<Signal>) -> Vec<Signal> {
    let mut index: HashMap<(String, String, String), usize> = HashMap::new();
    let mut out: Vec<Signal> = Vec::new();
    for signal in signals {
        let key = (
            signal.source_id.clone(),
            signal.signal_type.clone(),
            signal.region.clone(),
        );
        match index.get(&key) {
            Some(&at) => {
                if signal.value > out[at].value {
                    out[at] = signal;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(signal);
            }
        }
    }
    out.truncate(MAX_DERIVED_SIGNALS);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use forensics_core::Signal;

    fn financial(source: &str, domain: &str, value: f64, observed_at: i64) -> Signal {
        Signal {
            source_id: source.to_string(),
            region: "global".to_string(),
            domain: domain.to_string(),
            signal_type: "market_volatility".to_string(),
            value,
            confidence: 0.9,
            observed_at,
            evidence_ids: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn too_few_nodes_returns_empty() {
        let board = Blackboard::in_memory("test");
        let signals = vec![
            financial("a", "market", 10.0, 1_000),
            financial("b", "market", 10.0, 1_000),
        ];
        let out = TopologyDeriver::new()
            .derive("finance", &signals, &board, 1_000)
            .await;
        assert!(out.signals.is_empty());
        assert_eq!(out.diagnostics.node_count, 0);
        assert_eq!(out.diagnostics.tsi, 0.0);
    }

    #[tokio::test]
    async fn multi_domain_batch_emits_hyperedge_signals() {
        let board = Blackboard::in_memory("test");
        let ts = 1_700_000_000_000_i64;
        let mut signals = Vec::new();
        for (i, &domain) in ["market", "market", "prediction", "prediction", "economic", "economic"]
            .iter()
            .enumerate()
        {
            signals.push(financial(&format!("s{i}"), domain, 50.0, ts));
        }

        let out = TopologyDeriver::new()
            .derive("finance", &signals, &board, ts)
            .await;

        assert!(out.diagnostics.hyperedge_count >= 1);
        assert_eq!(out.diagnostics.node_count, 6);

        let density = out
            .signals
            .iter()
            .find(|s| s.signal_type == "topology_hyperedge_density")
            .expect("density signal");
        assert!(density.value > 0.0);

        let sync = out
            .signals
            .iter()
            .find(|s| s.signal_type == "topology_cross_domain_sync")
            .expect("sync signal");
        assert!(sync.value > 0.0);

        // Globals always present.
        assert!(out.signals.iter().any(|s| s.signal_type == "topology_tsi"));
        assert!(out.signals.iter().any(|s| s.signal_type == "topology_beta1"));
    }

    #[tokio::test]
    async fn derived_values_stay_in_range() {
        let board = Blackboard::in_memory("test");
        let ts = 1_700_000_000_000_i64;
        let signals: Vec<Signal> = (0..12)
            .map(|i| {
                financial(
                    &format!("s{i}"),
                    ["market", "prediction", "economic"][i % 3],
                    (i as f64 + 1.0) * 7.0,
                    ts - (i as i64) * 60_000,
                )
            })
            .collect();

        let out = TopologyDeriver::new()
            .derive("finance", &signals, &board, ts)
            .await;
        assert!(out.diagnostics.tsi >= 0.0 && out.diagnostics.tsi <= 100.0);
        for signal in &out.signals {
            if signal.signal_type == "topology_beta1" {
                assert!(signal.value >= 0.0);
                continue;
            }
            assert!(
                (0.0..=100.0).contains(&signal.value),
                "{} out of range: {}",
                signal.signal_type,
                signal.value
            );
        }
        assert!(out.signals.len() <= MAX_DERIVED_SIGNALS);
    }

    #[tokio::test]
    async fn baseline_delta_emitted_after_warmup() {
        let board = Blackboard::in_memory("test");
        // Seed a tight baseline for the global TSI metric.
        let mut stats = BaselineStats::new();
        for (i, v) in [10.0, 10.5, 9.5, 10.2, 9.8, 10.0].iter().enumerate() {
            stats.update(*v, i as i64);
        }
        board
            .write_baseline("finance", "global", "topology_tsi", stats)
            .await;

        let tsi_signal = Signal {
            source_id: "topology:tsi:finance".to_string(),
            region: "global".to_string(),
            domain: "finance".to_string(),
            signal_type: "topology_tsi".to_string(),
            value: 60.0,
            confidence: 0.9,
            observed_at: 1_000,
            evidence_ids: BTreeSet::new(),
        };

        let deltas = TopologyDeriver::new()
            .baseline_deltas("finance", &[tsi_signal], &board, 1_000)
            .await;
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].signal_type, "topology_tsi_baseline_delta");
        assert!(deltas[0].value > 0.0 && deltas[0].value <= 100.0);

        // The observation itself was folded into the baseline.
        let updated = board
            .read_baseline("finance", "global", "topology_tsi")
            .await
            .unwrap();
        assert_eq!(updated.count, 7);
        assert_eq!(updated.last_value, 60.0);
    }

    #[tokio::test]
    async fn baseline_needs_warmup_count() {
        let board = Blackboard::in_memory("test");
        let mut stats = BaselineStats::new();
        for (i, v) in [10.0, 10.5, 9.5].iter().enumerate() {
            stats.update(*v, i as i64);
        }
        board
            .write_baseline("finance", "global", "topology_tsi", stats)
            .await;

        let tsi_signal = Signal {
            source_id: "topology:tsi:finance".to_string(),
            region: "global".to_string(),
            domain: "finance".to_string(),
            signal_type: "topology_tsi".to_string(),
            value: 90.0,
            confidence: 0.9,
            observed_at: 1_000,
            evidence_ids: BTreeSet::new(),
        };
        let deltas = TopologyDeriver::new()
            .baseline_deltas("finance", &[tsi_signal], &board, 1_000)
            .await;
        assert!(deltas.is_empty());
    }

    #[test]
    fn dedup_keeps_higher_value() {
        let a = financial("s", "market", 10.0, 1);
        let mut b = financial("s", "market", 30.0, 2);
        b.signal_type = a.signal_type.clone();
        let out = dedup_signals(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 30.0);
    }
}
