//! Topology Deriver
//!
//! Builds a correlation graph over financial-domain signals, runs a
//! Vietoris-Rips persistence computation over it, and re-emits the
//! structural findings as derived signals (`topology_*`) that flow through
//! the same fusion and anomaly passes as raw observations.

pub mod filter;
pub mod graph;
pub mod homology;
pub mod hyperedge;

mod deriver;

pub use deriver::{TopologyDerivation, TopologyDeriver};
