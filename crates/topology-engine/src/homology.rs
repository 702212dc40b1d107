//! Persistent homology over a Vietoris-Rips filtration.
//!
//! The filtration carries every 0-simplex at weight 0, every 1-simplex at
//! its pairwise distance, and every 2-simplex at the maximum of its three
//! edge distances. Standard boundary-matrix reduction (columns combined by
//! symmetric difference) extracts the persistence pairs. Simplices are
//! ordered by `(weight, dimension, vertices)` so the reduction is
//! reproducible across platforms.

use nalgebra::DMatrix;
use std::collections::HashMap;

/// Pairs below this persistence are treated as numerical noise.
pub const MIN_PERSISTENCE: f64 = 1e-6;

/// Persistence threshold for counting a loop into beta-1.
pub const BETA1_PERSISTENCE: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct PersistencePair {
    /// Dimension of the creator simplex (0 = component, 1 = loop).
    pub dim: usize,
    pub birth: f64,
    pub death: f64,
    /// Classes that never die take death = 1.0 and are marked essential.
    pub essential: bool,
}

impl PersistencePair {
    pub fn persistence(&self) -> f64 {
        self.death - self.birth
    }
}

struct Simplex {
    vertices: Vec<usize>,
    weight: f64,
}

fn symmetric_difference(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Persistence pairs of the Rips filtration over a distance matrix.
/// Pairs with persistence below [`MIN_PERSISTENCE`] are dropped; essential
/// classes of dimension 0 and 1 are reported with death 1.0.
pub fn persistence_pairs(distances: &DMatrix<f64>) -> Vec<PersistencePair> {
    let n = distances.nrows();
    if n == 0 {
        return Vec::new();
    }

    let mut simplices: Vec<Simplex> = Vec::with_capacity(n + n * n);
    for v in 0..n {
        simplices.push(Simplex {
            vertices: vec![v],
            weight: 0.0,
        });
    }
    for i in 0..n {
        for j in (i + 1)..n {
            simplices.push(Simplex {
                vertices: vec![i, j],
                weight: distances[(i, j)],
            });
        }
    }
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                let weight = distances[(i, j)]
                    .max(distances[(i, k)])
                    .max(distances[(j, k)]);
                simplices.push(Simplex {
                    vertices: vec![i, j, k],
                    weight,
                });
            }
        }
    }

    simplices.sort_by(|a, b| {
        a.weight
            .partial_cmp(&b.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.vertices.len().cmp(&b.vertices.len()))
            .then_with(|| a.vertices.cmp(&b.vertices))
    });

    let mut index_of: HashMap<Vec<usize>, usize> = HashMap::with_capacity(simplices.len());
    for (idx, simplex) in simplices.iter().enumerate() {
        index_of.insert(simplex.vertices.clone(), idx);
    }

    // Boundary columns, each a sorted list of face indices.
    let mut columns: Vec<Vec<usize>> = simplices
        .iter()
        .map(|simplex| {
            if simplex.vertices.len() < 2 {
                return Vec::new();
            }
            let mut faces: Vec<usize> = (0..simplex.vertices.len())
                .map(|omit| {
                    let face: Vec<usize> = simplex
                        .vertices
                        .iter()
                        .enumerate()
                        .filter(|(pos, _)| *pos != omit)
                        .map(|(_, v)| *v)
                        .collect();
                    index_of[&face]
                })
                .collect();
            faces.sort_unstable();
            faces
        })
        .collect();

    let total = simplices.len();
    let mut pivot_owner: HashMap<usize, usize> = HashMap::new();
    let mut paired = vec![false; total];
    let mut pairs = Vec::new();

    for j in 0..total {
        loop {
            let Some(&low) = columns[j].last() else { break };
            let Some(&owner) = pivot_owner.get(&low) else {
                break;
            };
            let reduced = symmetric_difference(&columns[j], &columns[owner]);
            columns[j] = reduced;
        }
        if let Some(&low) = columns[j].last() {
            pivot_owner.insert(low, j);
            paired[low] = true;
            paired[j] = true;
            pairs.push(PersistencePair {
                dim: simplices[low].vertices.len() - 1,
                birth: simplices[low].weight,
                death: simplices[j].weight,
                essential: false,
            });
        }
    }

    for j in 0..total {
        if !paired[j] && columns[j].is_empty() {
            let dim = simplices[j].vertices.len() - 1;
            if dim < 2 {
                pairs.push(PersistencePair {
                    dim,
                    birth: simplices[j].weight,
                    death: 1.0,
                    essential: true,
                });
            }
        }
    }

    pairs.retain(|p| p.persistence() > MIN_PERSISTENCE);
    pairs
}

/// Summed persistence per homology dimension plus the essential H0 count.
#[derive(Debug, Clone, Default)]
pub struct PersistenceTotals {
    pub total_h0: f64,
    pub total_h1: f64,
    pub beta1: usize,
    pub component_count: usize,
}

pub fn totals(pairs: &[PersistencePair]) -> PersistenceTotals {
    let mut out = PersistenceTotals::default();
    for pair in pairs {
        match pair.dim {
            0 => {
                out.total_h0 += pair.persistence();
                if pair.essential {
                    out.component_count += 1;
                }
            }
            1 => {
                out.total_h1 += pair.persistence();
                if pair.persistence() > BETA1_PERSISTENCE {
                    out.beta1 += 1;
                }
            }
            _ => {}
        }
    }
    out
}
