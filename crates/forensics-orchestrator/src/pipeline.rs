//! The Forensics Shadow Pipeline orchestrator.
//!
//! One invocation = one run record. Phases execute strictly in trace order:
//! the ingest and pattern-of-life leaves, topology enrichment, policy
//! selection, then the two analysis phases in the learned order, then
//! persistence. Analysis failures feed a negative policy reward, mark the
//! remaining analysis phase skipped, and surface a failed run with partial
//! artifacts.

use crate::trace::TraceRecorder;
use blackboard::Blackboard;
use forensics_core::{
    now_ms, CalibratedAnomaly, ForensicsConfig, ForensicsError, ForensicsResult, FusedSignal,
    PhaseStatus, PolicyAction, RunRecord, RunStatus, Signal,
};
use run_policy::{Exploration, ThreadRngExploration};
use signal_ingest::{evidence_signals, normalize_batch, RawSignal, DEFAULT_DOMAIN};
use std::sync::Arc;
use topology_engine::TopologyDeriver;
use worker_client::WorkerClient;

pub const PHASE_INGEST: &str = "ingest-signals";
pub const PHASE_EXTRACT_POLE: &str = "extract-pole";
pub const PHASE_TOPOLOGY: &str = "topology-tda";
pub const PHASE_POLICY: &str = "policy-select";
pub const PHASE_FUSION: &str = "weak-supervision-fusion";
pub const PHASE_ANOMALY: &str = "conformal-anomaly";
pub const PHASE_PERSIST: &str = "persist-results";

/// A shadow-run request after transport decoding.
#[derive(Debug, Clone)]
pub struct ShadowRequest {
    pub domain: String,
    pub signals: Vec<RawSignal>,
    pub alpha: f64,
    pub persist: bool,
    pub evidence_ids: Vec<String>,
}

impl ShadowRequest {
    pub fn new(domain: impl Into<String>, signals: Vec<RawSignal>) -> Self {
        Self {
            domain: domain.into(),
            signals,
            alpha: 0.05,
            persist: true,
            evidence_ids: Vec::new(),
        }
    }
}

pub struct ForensicsPipeline {
    config: ForensicsConfig,
    board: Arc<Blackboard>,
    topology: TopologyDeriver,
    worker: Option<WorkerClient>,
    exploration: Arc<dyn Exploration>,
}

impl ForensicsPipeline {
    pub fn new(config: ForensicsConfig, board: Arc<Blackboard>) -> Self {
        let worker = config
            .worker_url
            .as_ref()
            .map(|url| WorkerClient::new(url.clone(), config.worker_shared_secret.clone()));
        Self {
            config,
            board,
            topology: TopologyDeriver::new(),
            worker,
            exploration: Arc::new(ThreadRngExploration),
        }
    }

    /// Replace the exploration source (tests pin it to a constant).
    pub fn with_exploration(mut self, exploration: Arc<dyn Exploration>) -> Self {
        self.exploration = exploration;
        self
    }

    pub fn blackboard(&self) -> &Arc<Blackboard> {
        &self.board
    }

    pub fn config(&self) -> &ForensicsConfig {
        &self.config
    }

    /// Execute one shadow run end to end.
    pub async fn run_shadow(&self, request: ShadowRequest) -> ForensicsResult<RunRecord> {
        if !(request.alpha > 0.0 && request.alpha <= 1.0) {
            return Err(ForensicsError::InvalidArgument(format!(
                "alpha must be in (0, 1], got {}",
                request.alpha
            )));
        }

        let domain = if request.domain.trim().is_empty() {
            DEFAULT_DOMAIN.to_string()
        } else {
            request.domain.trim().to_string()
        };
        let alpha = request.alpha;
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = now_ms();
        let mut trace = TraceRecorder::new();

        tracing::info!(%run_id, %domain, alpha, signals = request.signals.len(), "shadow run started");

        // Leaf phases: batch normalization and pattern-of-life extraction.
        let normalized: Vec<Signal> = trace
            .run_phase(PHASE_INGEST, &[], || async {
                Ok(normalize_batch(&request.signals, &domain, started_at).collect())
            })
            .await?;
        let pole: Vec<Signal> = trace
            .run_phase(PHASE_EXTRACT_POLE, &[], || async {
                Ok(evidence_signals(&request.evidence_ids, &domain, started_at))
            })
            .await?;

        if normalized.is_empty() && pole.is_empty() {
            return Err(ForensicsError::EmptyBatch);
        }

        let mut enriched = normalized;
        enriched.extend(pole);

        // Topology enrichment over the financial slice.
        let derivation = trace
            .run_phase(PHASE_TOPOLOGY, &[PHASE_INGEST, PHASE_EXTRACT_POLE], || async {
                Ok(self
                    .topology
                    .derive(&domain, &enriched, &self.board, started_at)
                    .await)
            })
            .await?;
        enriched.extend(derivation.signals.iter().cloned());

        // Policy selection over the enriched batch.
        let hash = run_policy::state_hash(&domain, alpha, &enriched);
        let order = trace
            .run_phase(PHASE_POLICY, &[PHASE_TOPOLOGY], || async {
                Ok(run_policy::select_order(
                    &self.board,
                    &self.config,
                    &domain,
                    hash,
                    self.exploration.as_ref(),
                )
                .await)
            })
            .await?;

        let mut fused: Vec<FusedSignal> = Vec::new();
        let mut anomalies: Vec<CalibratedAnomaly> = Vec::new();
        let mut worker_served = 0usize;
        let mut worker_fallbacks = 0usize;
        let mut failure: Option<ForensicsError> = None;

        for action in order {
            if failure.is_some() {
                trace.record_skipped(action.as_str(), &[PHASE_POLICY]);
                continue;
            }

            let phase = action.as_str();
            let result = match action {
                PolicyAction::WeakSupervisionFusion => {
                    let outcome = trace
                        .run_phase(phase, &[PHASE_POLICY], || {
                            self.fusion_phase(&domain, &enriched, alpha)
                        })
                        .await;
                    outcome.map(|(rows, served)| {
                        let count = rows.len();
                        fused = rows;
                        (count, served)
                    })
                }
                PolicyAction::ConformalAnomaly => {
                    let outcome = trace
                        .run_phase(phase, &[PHASE_POLICY], || {
                            self.anomaly_phase(&domain, &enriched, alpha)
                        })
                        .await;
                    outcome.map(|(rows, served)| {
                        let count = rows.len();
                        anomalies = rows;
                        (count, served)
                    })
                }
            };

            let elapsed = trace.elapsed_of(phase);
            match result {
                Ok((rows, served)) => {
                    match served {
                        WorkerUse::Remote => worker_served += 1,
                        WorkerUse::Fallback => worker_fallbacks += 1,
                        WorkerUse::Local => {}
                    }
                    let reward = run_policy::phase_reward(true, rows, elapsed);
                    run_policy::apply_update(
                        &self.board,
                        &self.config,
                        &domain,
                        hash,
                        action,
                        reward,
                        now_ms(),
                    )
                    .await;
                }
                Err(e) => {
                    run_policy::apply_update(
                        &self.board,
                        &self.config,
                        &domain,
                        hash,
                        action,
                        run_policy::phase_reward(false, 0, elapsed),
                        now_ms(),
                    )
                    .await;
                    failure = Some(ForensicsError::PhaseFailure {
                        phase: phase.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        // Causal discovery over the enriched batch; no trace entry of its
        // own, and skipped entirely on a failed run.
        let causal_edges = if failure.is_none() {
            causal_discovery::discover(&enriched)
        } else {
            Vec::new()
        };

        let worker_mode = if self.worker.is_none() {
            "local"
        } else if worker_fallbacks > 0 {
            "mixed"
        } else if worker_served > 0 {
            "remote"
        } else {
            "local"
        };

        let mut run = RunRecord {
            run_id: run_id.clone(),
            domain: domain.clone(),
            started_at,
            completed_at: Some(now_ms()),
            status: if failure.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            },
            worker_mode: worker_mode.to_string(),
            alpha,
            signal_count: enriched.len(),
            fused_signals: fused,
            anomalies,
            causal_edges,
            trace: Vec::new(),
            diagnostics: derivation.diagnostics,
            error: failure.as_ref().map(|e| e.to_string()),
        };

        if request.persist {
            // The persist write cannot witness its own completion, so the
            // stored trace carries the entry as pending and the returned
            // record flips it to success.
            trace.record_pending(PHASE_PERSIST, &[PHASE_FUSION, PHASE_ANOMALY]);
            run.trace = trace.snapshot();
            self.board.save_run(&run).await;
            trace.finalize(PHASE_PERSIST, PhaseStatus::Success);
            run.trace = trace.snapshot();
            self.board.update_run(&run).await;
        } else {
            trace.record_skipped(PHASE_PERSIST, &[PHASE_FUSION, PHASE_ANOMALY]);
            run.trace = trace.snapshot();
        }

        tracing::info!(
            %run_id,
            %domain,
            status = ?run.status,
            fused = run.fused_signals.len(),
            anomalies = run.anomalies.len(),
            causal_edges = run.causal_edges.len(),
            worker_mode = %run.worker_mode,
            "shadow run finished"
        );

        Ok(run)
    }

    async fn fusion_phase(
        &self,
        domain: &str,
        signals: &[Signal],
        alpha: f64,
    ) -> ForensicsResult<(Vec<FusedSignal>, WorkerUse)> {
        if let Some(worker) = &self.worker {
            match worker.fuse(domain, signals, alpha).await {
                Ok(rows) => return Ok((rows, WorkerUse::Remote)),
                Err(e) => {
                    tracing::warn!(error = %e, "fusion worker unavailable; falling back to local");
                }
            }
        }
        let output = fusion_engine::fuse(signals);
        tracing::info!(
            labelers = output.model.signal_types.len(),
            class_prior = output.model.class_prior,
            iterations = output.model.iterations,
            converged = output.model.converged,
            "fusion model fitted"
        );
        let fallback = if self.worker.is_some() {
            WorkerUse::Fallback
        } else {
            WorkerUse::Local
        };
        Ok((output.fused, fallback))
    }

    async fn anomaly_phase(
        &self,
        domain: &str,
        signals: &[Signal],
        alpha: f64,
    ) -> ForensicsResult<(Vec<CalibratedAnomaly>, WorkerUse)> {
        if let Some(worker) = &self.worker {
            match worker.anomaly(domain, signals, alpha).await {
                Ok(rows) => return Ok((rows, WorkerUse::Remote)),
                Err(e) => {
                    tracing::warn!(error = %e, "anomaly worker unavailable; falling back to local");
                }
            }
        }
        let rows = anomaly_engine::score_batch(signals, alpha, &self.board).await;
        let fallback = if self.worker.is_some() {
            WorkerUse::Fallback
        } else {
            WorkerUse::Local
        };
        Ok((rows, fallback))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerUse {
    Local,
    Remote,
    Fallback,
}
