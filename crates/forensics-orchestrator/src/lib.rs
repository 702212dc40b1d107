//! Forensics Shadow Pipeline orchestration.
//!
//! Wires the ingestor, topology deriver, policy, fusion, anomaly, and
//! causal engines into one per-request run with a recorded phase-trace DAG,
//! persisting everything through the blackboard.

pub mod pipeline;
pub mod trace;

pub use pipeline::{
    ForensicsPipeline, ShadowRequest, PHASE_ANOMALY, PHASE_EXTRACT_POLE, PHASE_FUSION,
    PHASE_INGEST, PHASE_PERSIST, PHASE_POLICY, PHASE_TOPOLOGY,
};
pub use trace::TraceRecorder;
