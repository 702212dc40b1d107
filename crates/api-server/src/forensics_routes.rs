//! Forensics API Routes
//!
//! One route per pipeline operation plus a health probe. List and get
//! endpoints degrade to empty arrays with an `error` string when a domain
//! has no runs yet; a missing `run_id` is a hard 404.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use forensics_core::{
    BaselineStats, CalibratedAnomaly, ForensicsError, FusedSignal, PhaseTraceEntry, PolicyEntry,
    RunRecord, RunStatus, RunSummary,
};
use forensics_orchestrator::ShadowRequest;
use serde::{Deserialize, Serialize};
use signal_ingest::RawSignal;

use crate::{ApiResponse, AppError, AppState};

const MAX_LIMIT: usize = 500;

fn clamp_limit(limit: Option<usize>, default: usize) -> usize {
    limit.unwrap_or(default).min(MAX_LIMIT).max(1)
}

fn parse_status(raw: Option<&str>) -> Result<Option<RunStatus>, AppError> {
    match raw.map(str::to_lowercase).as_deref() {
        None | Some("") => Ok(None),
        Some("completed") => Ok(Some(RunStatus::Completed)),
        Some("failed") => Ok(Some(RunStatus::Failed)),
        Some(other) => Err(ForensicsError::InvalidArgument(format!(
            "unknown status filter '{other}'"
        ))
        .into()),
    }
}

/// Signal-type filter: exact match, trailing-`*` prefix match, or the
/// `"topology"` sentinel meaning every `topology_*` type.
fn matches_signal_type(filter: &str, signal_type: &str) -> bool {
    if filter == "topology" {
        return signal_type.starts_with("topology_");
    }
    if let Some(prefix) = filter.strip_suffix('*') {
        return signal_type.starts_with(prefix);
    }
    signal_type == filter
}

pub fn forensics_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/forensics/shadow-run", post(run_shadow))
        .route("/api/forensics/runs", get(list_runs))
        .route("/api/forensics/runs/:run_id", get(get_run))
        .route("/api/forensics/runs/:run_id/trace", get(get_trace))
        .route("/api/forensics/fused", get(list_fused))
        .route("/api/forensics/anomalies", get(list_anomalies))
        .route("/api/forensics/policy", get(get_policy))
        .route("/api/forensics/topology/summary", get(topology_summary))
        .route("/api/forensics/feedback", post(submit_feedback))
}

// ---- shadow run ----

#[derive(Debug, Deserialize)]
pub struct ShadowRunBody {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub signals: Vec<RawSignal>,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_true")]
    pub persist: bool,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
}

fn default_alpha() -> f64 {
    0.05
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ShadowRunResponse {
    pub run: RunSummary,
    pub fused_signals: Vec<FusedSignal>,
    pub anomalies: Vec<CalibratedAnomaly>,
    pub causal_edges: Vec<forensics_core::CausalEdge>,
    pub trace: Vec<PhaseTraceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn run_shadow(
    State(state): State<AppState>,
    Json(body): Json<ShadowRunBody>,
) -> Result<Json<ApiResponse<ShadowRunResponse>>, AppError> {
    let request = ShadowRequest {
        domain: body.domain,
        signals: body.signals,
        alpha: body.alpha,
        persist: body.persist,
        evidence_ids: body.evidence_ids,
    };
    let run = state.pipeline.run_shadow(request).await?;
    let response = ShadowRunResponse {
        run: run.summary(),
        error: run.error.clone(),
        fused_signals: run.fused_signals,
        anomalies: run.anomalies,
        causal_edges: run.causal_edges,
        trace: run.trace,
    };
    Ok(Json(ApiResponse::success(response)))
}

// ---- run lookups ----

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub domain: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunSummary>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ApiResponse<ListRunsResponse>>, AppError> {
    let status = parse_status(query.status.as_deref())?;
    let limit = clamp_limit(query.limit, 50);
    let runs = state
        .board()
        .list_runs(query.domain.as_deref(), status, limit, query.offset)
        .await;
    Ok(Json(ApiResponse::success(ListRunsResponse {
        runs: runs.iter().map(RunRecord::summary).collect(),
    })))
}

#[derive(Debug, Serialize)]
pub struct GetRunResponse {
    pub run: RunRecord,
    pub fused_count: usize,
    pub anomaly_count: usize,
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ApiResponse<GetRunResponse>>, AppError> {
    let run = state
        .board()
        .get_run(&run_id)
        .await
        .ok_or_else(|| ForensicsError::NotFound(format!("run '{run_id}'")))?;
    let fused_count = run.fused_signals.len();
    let anomaly_count = run.anomalies.len();
    Ok(Json(ApiResponse::success(GetRunResponse {
        run,
        fused_count,
        anomaly_count,
    })))
}

#[derive(Debug, Serialize)]
pub struct TraceResponse {
    pub run: RunSummary,
    pub trace: Vec<PhaseTraceEntry>,
}

async fn get_trace(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ApiResponse<TraceResponse>>, AppError> {
    let run = state
        .board()
        .get_run(&run_id)
        .await
        .ok_or_else(|| ForensicsError::NotFound(format!("run '{run_id}'")))?;
    Ok(Json(ApiResponse::success(TraceResponse {
        run: run.summary(),
        trace: run.trace,
    })))
}

/// Resolve the run a list endpoint operates on: explicit run_id (404 when
/// unknown), else the domain's newest run (None when the domain is empty).
async fn resolve_run(
    state: &AppState,
    run_id: Option<&str>,
    domain: Option<&str>,
) -> Result<Option<RunRecord>, AppError> {
    match (run_id, domain) {
        (Some(id), _) => state
            .board()
            .get_run(id)
            .await
            .map(Some)
            .ok_or_else(|| ForensicsError::NotFound(format!("run '{id}'")).into()),
        (None, Some(d)) if !d.is_empty() => Ok(state.board().latest_run(d).await),
        _ => Err(ForensicsError::InvalidArgument(
            "run_id or domain is required".to_string(),
        )
        .into()),
    }
}

// ---- fused signals ----

#[derive(Debug, Deserialize)]
pub struct ListFusedQuery {
    pub run_id: Option<String>,
    pub domain: Option<String>,
    pub region: Option<String>,
    pub min_score: Option<f64>,
    pub min_probability: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListFusedResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunSummary>,
    pub signals: Vec<FusedSignal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn list_fused(
    State(state): State<AppState>,
    Query(query): Query<ListFusedQuery>,
) -> Result<Json<ApiResponse<ListFusedResponse>>, AppError> {
    let run = resolve_run(&state, query.run_id.as_deref(), query.domain.as_deref()).await?;
    let Some(run) = run else {
        return Ok(Json(ApiResponse::success(ListFusedResponse {
            run: None,
            signals: Vec::new(),
            error: Some(format!(
                "no runs recorded for domain '{}'",
                query.domain.unwrap_or_default()
            )),
        })));
    };

    let limit = clamp_limit(query.limit, 100);
    let signals: Vec<FusedSignal> = run
        .fused_signals
        .iter()
        .filter(|f| query.region.as_deref().map(|r| f.region == r).unwrap_or(true))
        .filter(|f| query.min_score.map(|s| f.score >= s).unwrap_or(true))
        .filter(|f| {
            query
                .min_probability
                .map(|p| f.probability >= p)
                .unwrap_or(true)
        })
        .take(limit)
        .cloned()
        .collect();

    Ok(Json(ApiResponse::success(ListFusedResponse {
        run: Some(run.summary()),
        signals,
        error: None,
    })))
}

// ---- calibrated anomalies ----

#[derive(Debug, Deserialize)]
pub struct ListAnomaliesQuery {
    pub run_id: Option<String>,
    pub domain: Option<String>,
    pub signal_type: Option<String>,
    pub region: Option<String>,
    #[serde(default)]
    pub anomalies_only: bool,
    pub max_p_value: Option<f64>,
    pub min_abs_legacy_z: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListAnomaliesResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunSummary>,
    pub anomalies: Vec<CalibratedAnomaly>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn list_anomalies(
    State(state): State<AppState>,
    Query(query): Query<ListAnomaliesQuery>,
) -> Result<Json<ApiResponse<ListAnomaliesResponse>>, AppError> {
    let run = resolve_run(&state, query.run_id.as_deref(), query.domain.as_deref()).await?;
    let Some(run) = run else {
        return Ok(Json(ApiResponse::success(ListAnomaliesResponse {
            run: None,
            anomalies: Vec::new(),
            error: Some(format!(
                "no runs recorded for domain '{}'",
                query.domain.unwrap_or_default()
            )),
        })));
    };

    let limit = clamp_limit(query.limit, 100);
    let anomalies: Vec<CalibratedAnomaly> = run
        .anomalies
        .iter()
        .filter(|a| {
            query
                .signal_type
                .as_deref()
                .map(|t| matches_signal_type(t, &a.signal_type))
                .unwrap_or(true)
        })
        .filter(|a| query.region.as_deref().map(|r| a.region == r).unwrap_or(true))
        .filter(|a| !query.anomalies_only || a.is_anomaly)
        .filter(|a| query.max_p_value.map(|p| a.p_value <= p).unwrap_or(true))
        .filter(|a| {
            query
                .min_abs_legacy_z
                .map(|z| a.legacy_z_score.abs() >= z)
                .unwrap_or(true)
        })
        .take(limit)
        .cloned()
        .collect();

    Ok(Json(ApiResponse::success(ListAnomaliesResponse {
        run: Some(run.summary()),
        anomalies,
        error: None,
    })))
}

// ---- policy ----

#[derive(Debug, Deserialize)]
pub struct PolicyQuery {
    pub domain: String,
    pub state_hash: Option<u32>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PolicyResponse {
    pub entries: Vec<PolicyEntry>,
}

async fn get_policy(
    State(state): State<AppState>,
    Query(query): Query<PolicyQuery>,
) -> Result<Json<ApiResponse<PolicyResponse>>, AppError> {
    if query.domain.is_empty() {
        return Err(ForensicsError::InvalidArgument("domain is required".to_string()).into());
    }
    let limit = clamp_limit(query.limit, 100);
    let mut entries = state
        .board()
        .policy_entries(&query.domain, query.state_hash)
        .await;
    entries.truncate(limit);
    Ok(Json(ApiResponse::success(PolicyResponse { entries })))
}

// ---- topology summary ----

#[derive(Debug, Deserialize)]
pub struct TopologySummaryQuery {
    pub run_id: Option<String>,
    pub domain: Option<String>,
    pub alert_limit: Option<usize>,
    pub history_limit: Option<usize>,
    pub baseline_limit: Option<usize>,
    #[serde(default)]
    pub anomalies_only: bool,
}

#[derive(Debug, Serialize)]
pub struct TrendPoint {
    pub completed_at: i64,
    pub value: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricTrend {
    pub metric: String,
    pub points: Vec<TrendPoint>,
}

#[derive(Debug, Serialize)]
pub struct BaselineEntryOut {
    pub metric: String,
    pub baseline: BaselineStats,
}

#[derive(Debug, Serialize)]
pub struct TopologySummaryResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunSummary>,
    pub alerts: Vec<CalibratedAnomaly>,
    pub trends: Vec<MetricTrend>,
    pub baselines: Vec<BaselineEntryOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn topology_summary(
    State(state): State<AppState>,
    Query(query): Query<TopologySummaryQuery>,
) -> Result<Json<ApiResponse<TopologySummaryResponse>>, AppError> {
    let run = resolve_run(&state, query.run_id.as_deref(), query.domain.as_deref()).await?;
    let domain = query
        .domain
        .clone()
        .or_else(|| run.as_ref().map(|r| r.domain.clone()))
        .unwrap_or_default();

    let alert_limit = clamp_limit(query.alert_limit, 20);
    let alerts: Vec<CalibratedAnomaly> = run
        .as_ref()
        .map(|r| {
            r.anomalies
                .iter()
                .filter(|a| a.signal_type.starts_with("topology_"))
                .filter(|a| !query.anomalies_only || a.is_anomaly)
                .take(alert_limit)
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    // Trend points over the domain's run history, oldest first.
    let history_limit = clamp_limit(query.history_limit, 50);
    let mut history = state
        .board()
        .list_runs(Some(&domain), Some(RunStatus::Completed), history_limit, 0)
        .await;
    history.reverse();

    let mut tsi_points = Vec::new();
    let mut beta1_points = Vec::new();
    let mut hyperedge_points = Vec::new();
    for record in &history {
        let Some(completed_at) = record.completed_at else {
            continue;
        };
        tsi_points.push(TrendPoint {
            completed_at,
            value: record.diagnostics.tsi,
        });
        beta1_points.push(TrendPoint {
            completed_at,
            value: record.diagnostics.beta1 as f64,
        });
        hyperedge_points.push(TrendPoint {
            completed_at,
            value: record.diagnostics.hyperedge_count as f64,
        });
    }
    let trends = vec![
        MetricTrend {
            metric: "topology_tsi".to_string(),
            points: tsi_points,
        },
        MetricTrend {
            metric: "topology_beta1".to_string(),
            points: beta1_points,
        },
        MetricTrend {
            metric: "topology_hyperedge_count".to_string(),
            points: hyperedge_points,
        },
    ];

    let baseline_limit = clamp_limit(query.baseline_limit, 20);
    let mut baselines: Vec<BaselineEntryOut> = state
        .board()
        .baselines_for_domain(&domain)
        .into_iter()
        .map(|(metric, baseline)| BaselineEntryOut { metric, baseline })
        .collect();
    baselines.sort_by(|a, b| a.metric.cmp(&b.metric));
    baselines.truncate(baseline_limit);

    let error = if run.is_none() {
        Some(format!("no runs recorded for domain '{domain}'"))
    } else {
        None
    };

    Ok(Json(ApiResponse::success(TopologySummaryResponse {
        run: run.map(|r| r.summary()),
        alerts,
        trends,
        baselines,
        error,
    })))
}

// ---- feedback ----

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub source_id: String,
    pub signal_type: String,
    pub is_true_positive: bool,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub success: bool,
}

async fn submit_feedback(
    State(state): State<AppState>,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<ApiResponse<FeedbackResponse>>, AppError> {
    if body.source_id.trim().is_empty() || body.signal_type.trim().is_empty() {
        return Err(ForensicsError::InvalidArgument(
            "source_id and signal_type are required".to_string(),
        )
        .into());
    }
    state
        .board()
        .record_feedback(
            body.source_id.trim(),
            body.signal_type.trim(),
            body.is_true_positive,
            forensics_core::now_ms(),
        )
        .await;
    Ok(Json(ApiResponse::success(FeedbackResponse { success: true })))
}

// ---- health ----

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store_reachable: bool,
}

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let store_reachable = state.board().ping().await;
    Json(ApiResponse::success(HealthResponse {
        status: "ok",
        store_reachable,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_type_filter_variants() {
        assert!(matches_signal_type("ais_silence", "ais_silence"));
        assert!(!matches_signal_type("ais_silence", "ais_silence_ratio"));

        assert!(matches_signal_type("ais_*", "ais_silence"));
        assert!(matches_signal_type("ais_*", "ais_gap"));
        assert!(!matches_signal_type("ais_*", "market_volatility"));

        assert!(matches_signal_type("topology", "topology_tsi"));
        assert!(matches_signal_type("topology", "topology_cycle_risk"));
        assert!(!matches_signal_type("topology", "topologyish"));
        assert!(!matches_signal_type("topology", "market_volatility"));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(parse_status(None).unwrap(), None);
        assert_eq!(
            parse_status(Some("completed")).unwrap(),
            Some(RunStatus::Completed)
        );
        assert_eq!(parse_status(Some("FAILED")).unwrap(), Some(RunStatus::Failed));
        assert!(parse_status(Some("running")).is_err());
    }

    #[test]
    fn limits_clamped() {
        assert_eq!(clamp_limit(None, 100), 100);
        assert_eq!(clamp_limit(Some(10), 100), 10);
        assert_eq!(clamp_limit(Some(9_999), 100), MAX_LIMIT);
        assert_eq!(clamp_limit(Some(0), 100), 1);
    }
}
