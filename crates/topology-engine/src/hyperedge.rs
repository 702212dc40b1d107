//! Cross-domain hyperedge enumeration.
//!
//! A hyperedge is a set of three or four nodes whose pairwise similarities
//! all clear a threshold, whose observations fall inside a narrow window,
//! and which span at least three distinct domains. They proxy coordinated
//! behavior that no single-domain view would surface.

use crate::graph::TopologyNode;
use nalgebra::DMatrix;
use std::collections::BTreeSet;

pub const HYPEREDGE_SIMILARITY: f64 = 0.6;
pub const HYPEREDGE_WINDOW_MS: i64 = 4 * 60 * 60 * 1000;
pub const MAX_HYPEREDGES: usize = 20;

#[derive(Debug, Clone)]
pub struct Hyperedge {
    /// Node indices, ascending.
    pub members: Vec<usize>,
    pub mean_similarity: f64,
}

fn pairwise_ok(members: &[usize], similarities: &DMatrix<f64>) -> bool {
    for (pos, &i) in members.iter().enumerate() {
        for &j in &members[pos + 1..] {
            if similarities[(i, j)] < HYPEREDGE_SIMILARITY {
                return false;
            }
        }
    }
    true
}

fn within_window(members: &[usize], nodes: &[TopologyNode]) -> bool {
    let times: Vec<i64> = members.iter().map(|&i| nodes[i].observed_at).collect();
    let min = times.iter().min().copied().unwrap_or(0);
    let max = times.iter().max().copied().unwrap_or(0);
    max - min <= HYPEREDGE_WINDOW_MS
}

fn distinct_domains(members: &[usize], nodes: &[TopologyNode]) -> usize {
    members
        .iter()
        .map(|&i| nodes[i].domain.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

fn mean_similarity(members: &[usize], similarities: &DMatrix<f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (pos, &i) in members.iter().enumerate() {
        for &j in &members[pos + 1..] {
            sum += similarities[(i, j)];
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Enumerate hyperedges: every qualifying triple, extended to a quad when a
/// fourth node keeps every constraint (the quad then subsumes its triples).
/// Deduplicated by subset containment, capped at [`MAX_HYPEREDGES`] by mean
/// similarity.
pub fn enumerate(nodes: &[TopologyNode], similarities: &DMatrix<f64>) -> Vec<Hyperedge> {
    let n = nodes.len();
    let mut candidates: Vec<Vec<usize>> = Vec::new();

    for i in 0..n {
        for j in (i + 1)..n {
            if similarities[(i, j)] < HYPEREDGE_SIMILARITY {
                continue;
            }
            for k in (j + 1)..n {
                let triple = [i, j, k];
                if !pairwise_ok(&triple, similarities)
                    || !within_window(&triple, nodes)
                    || distinct_domains(&triple, nodes) < 3
                {
                    continue;
                }

                let mut members = triple.to_vec();
                for l in (k + 1)..n {
                    let quad = [i, j, k, l];
                    if pairwise_ok(&quad, similarities)
                        && within_window(&quad, nodes)
                        && distinct_domains(&quad, nodes) >= 3
                    {
                        members = quad.to_vec();
                        break;
                    }
                }
                candidates.push(members);
            }
        }
    }

    // Drop any candidate strictly contained in another.
    let sets: Vec<BTreeSet<usize>> = candidates
        .iter()
        .map(|m| m.iter().copied().collect())
        .collect();
    let mut kept: Vec<Hyperedge> = Vec::new();
    let mut seen: Vec<BTreeSet<usize>> = Vec::new();
    for (idx, set) in sets.iter().enumerate() {
        let subsumed = sets
            .iter()
            .enumerate()
            .any(|(other, candidate)| other != idx && set != candidate && set.is_subset(candidate));
        if subsumed || seen.contains(set) {
            continue;
        }
        seen.push(set.clone());
        kept.push(Hyperedge {
            members: candidates[idx].clone(),
            mean_similarity: mean_similarity(&candidates[idx], similarities),
        });
    }

    kept.sort_by(|a, b| {
        b.mean_similarity
            .partial_cmp(&a.mean_similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.members.cmp(&b.members))
    });
    kept.truncate(MAX_HYPEREDGES);
    kept
}

/// Distinct node indices participating in any hyperedge.
pub fn participating_nodes(hyperedges: &[Hyperedge]) -> BTreeSet<usize> {
    hyperedges
        .iter()
        .flat_map(|h| h.members.iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(source: &str, domain: &str, observed_at: i64) -> TopologyNode {
        TopologyNode {
            source_id: source.to_string(),
            domain: domain.to_string(),
            region: "global".to_string(),
            accumulated_value: 10.0,
            confidence: 0.8,
            signal_types: ["volatility".to_string()].into_iter().collect(),
            observed_at,
            signal_count: 1,
        }
    }

    fn full_similarity(n: usize, sim: f64) -> DMatrix<f64> {
        let mut m = DMatrix::from_element(n, n, sim);
        for i in 0..n {
            m[(i, i)] = 1.0;
        }
        m
    }

    #[test]
    fn requires_three_domains() {
        let nodes = vec![
            node("a", "market", 0),
            node("b", "market", 0),
            node("c", "prediction", 0),
        ];
        let sims = full_similarity(3, 0.9);
        assert!(enumerate(&nodes, &sims).is_empty());
    }

    #[test]
    fn cross_domain_triple_found_and_extended() {
        let nodes = vec![
            node("a", "market", 0),
            node("b", "prediction", 0),
            node("c", "economic", 0),
            node("d", "market", 0),
        ];
        let sims = full_similarity(4, 0.9);
        let edges = enumerate(&nodes, &sims);
        // Every triple extends to the same quad and dedup collapses them.
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].members, vec![0, 1, 2, 3]);
        assert_eq!(participating_nodes(&edges).len(), 4);
    }

    #[test]
    fn window_excludes_stale_nodes() {
        let nodes = vec![
            node("a", "market", 0),
            node("b", "prediction", 0),
            node("c", "economic", HYPEREDGE_WINDOW_MS + 1),
        ];
        let sims = full_similarity(3, 0.9);
        assert!(enumerate(&nodes, &sims).is_empty());
    }

    #[test]
    fn weak_similarity_excluded() {
        let nodes = vec![
            node("a", "market", 0),
            node("b", "prediction", 0),
            node("c", "economic", 0),
        ];
        let sims = full_similarity(3, 0.5);
        assert!(enumerate(&nodes, &sims).is_empty());
    }
}
