//! Blackboard
//!
//! Shared persistence surface for the forensics pipeline. All run state
//! (calibration history, Q-table, topology baselines, run records and
//! history rings) lives behind this one object: an in-memory cache per
//! scope, write-through to a pluggable [`BackingStore`].
//!
//! Persistence is best-effort by contract: store reads race a 3 s timeout
//! and fall back to "empty", store writes never raise. Within one process
//! the caches are authoritative; across processes the store provides
//! last-writer-wins recovery at the granularity of the scope key.

pub mod store;

pub use store::{BackingStore, MemoryBackingStore, RedisBackingStore, StoreError};

use dashmap::DashMap;
use forensics_core::{
    BaselineStats, CalibrationWindow, PolicyAction, PolicyEntry, RunRecord, RunStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Calibration history ring capacity per metric key.
pub const CALIBRATION_CAPACITY: usize = 200;

/// Run-history ring capacity per domain (and globally).
pub const RUN_HISTORY_CAPACITY: usize = 1000;

/// Feedback ring capacity per (source_id, signal_type).
pub const FEEDBACK_CAPACITY: usize = 500;

/// Hard deadline on any single backing-store operation.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(3);

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
pub const RUN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const RUN_HISTORY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const CALIBRATION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const POLICY_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const BASELINE_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);
pub const FEEDBACK_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Parallel value/timestamp ring for one metric key, oldest entries first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationRing {
    pub values: VecDeque<f64>,
    pub observed_at: VecDeque<i64>,
}

impl CalibrationRing {
    /// Append one observation, evicting from the front at capacity.
    pub fn push(&mut self, value: f64, observed_at: i64) {
        if self.values.len() >= CALIBRATION_CAPACITY {
            self.values.pop_front();
            self.observed_at.pop_front();
        }
        self.values.push_back(value);
        self.observed_at.push_back(observed_at);
    }

    pub fn window(&self) -> CalibrationWindow {
        CalibrationWindow {
            values: self.values.iter().copied().collect(),
            observed_at: self.observed_at.iter().copied().collect(),
        }
    }
}

/// One analyst feedback vote on a fused source/labeler pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub source_id: String,
    pub signal_type: String,
    pub is_true_positive: bool,
    pub recorded_at: i64,
}

pub struct Blackboard {
    prefix: String,
    store: Arc<dyn BackingStore>,
    calibration: DashMap<String, CalibrationRing>,
    baselines: DashMap<String, BaselineStats>,
    /// Per-domain Q-table, cell key `<state_hash>:<action>`.
    policy: DashMap<String, HashMap<String, PolicyEntry>>,
    runs: DashMap<String, RunRecord>,
    history: DashMap<String, VecDeque<String>>,
    feedback: DashMap<String, VecDeque<FeedbackEntry>>,
}

impl Blackboard {
    pub fn new(prefix: impl Into<String>, store: Arc<dyn BackingStore>) -> Self {
        Self {
            prefix: prefix.into(),
            store,
            calibration: DashMap::new(),
            baselines: DashMap::new(),
            policy: DashMap::new(),
            runs: DashMap::new(),
            history: DashMap::new(),
            feedback: DashMap::new(),
        }
    }

    /// Memory-backed blackboard for tests and store-less deployments.
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(prefix, Arc::new(MemoryBackingStore::new()))
    }

    /// Metric key shared by calibration history and the anomaly engine.
    pub fn metric_key(domain: &str, signal_type: &str, region: &str) -> String {
        format!("{domain}:{signal_type}:{region}")
    }

    fn key(&self, scope: &str, rest: &str) -> String {
        format!("{}:{scope}:{rest}", self.prefix)
    }

    /// Store read with the 3 s deadline; timeout and errors degrade to None.
    async fn store_get(&self, key: &str) -> Option<Value> {
        match tokio::time::timeout(STORE_TIMEOUT, self.store.get_json(key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                tracing::warn!(key, error = %e, "blackboard read failed; treating as empty");
                None
            }
            Err(_) => {
                tracing::warn!(key, "blackboard read timed out; treating as empty");
                None
            }
        }
    }

    /// Store write with the 3 s deadline; failures are logged, never raised.
    async fn store_set(&self, key: &str, value: Value, ttl: Duration) {
        match tokio::time::timeout(STORE_TIMEOUT, self.store.set_json_with_ttl(key, &value, ttl))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(key, error = %e, "blackboard write failed"),
            Err(_) => tracing::warn!(key, "blackboard write timed out"),
        }
    }

    // ---- calibration history ----

    /// Calibration window for a metric, oldest first. Empty when unknown.
    pub async fn fetch_calibration(
        &self,
        domain: &str,
        signal_type: &str,
        region: &str,
    ) -> CalibrationWindow {
        let metric = Self::metric_key(domain, signal_type, region);
        if let Some(ring) = self.calibration.get(&metric) {
            return ring.window();
        }
        let key = self.key("calibration", &metric);
        if let Some(raw) = self.store_get(&key).await {
            if let Ok(ring) = serde_json::from_value::<CalibrationRing>(raw) {
                let window = ring.window();
                self.calibration.entry(metric).or_insert(ring);
                return window;
            }
        }
        CalibrationWindow::default()
    }

    /// Append one observation to a metric's ring. The in-cache mutation is
    /// atomic per metric key; the store write is last-writer-wins.
    pub async fn append_calibration(
        &self,
        domain: &str,
        signal_type: &str,
        region: &str,
        value: f64,
        observed_at: i64,
    ) {
        let metric = Self::metric_key(domain, signal_type, region);
        if !self.calibration.contains_key(&metric) {
            // Hydrate from the store before first mutation.
            let _ = self.fetch_calibration(domain, signal_type, region).await;
        }
        let snapshot = {
            let mut ring = self.calibration.entry(metric.clone()).or_default();
            ring.push(value, observed_at);
            ring.clone()
        };
        let key = self.key("calibration", &metric);
        match serde_json::to_value(&snapshot) {
            Ok(raw) => self.store_set(&key, raw, CALIBRATION_TTL).await,
            Err(e) => tracing::warn!(key, error = %e, "failed to serialize calibration ring"),
        }
    }

    // ---- topology baselines ----

    pub async fn read_baseline(
        &self,
        domain: &str,
        region: &str,
        signal_type: &str,
    ) -> Option<BaselineStats> {
        let scoped = format!("{domain}:{region}:{signal_type}");
        if let Some(stats) = self.baselines.get(&scoped) {
            return Some(stats.clone());
        }
        let key = self.key("baseline", &scoped);
        let raw = self.store_get(&key).await?;
        let stats = serde_json::from_value::<BaselineStats>(raw).ok()?;
        self.baselines.insert(scoped, stats.clone());
        Some(stats)
    }

    pub async fn write_baseline(
        &self,
        domain: &str,
        region: &str,
        signal_type: &str,
        stats: BaselineStats,
    ) {
        let scoped = format!("{domain}:{region}:{signal_type}");
        let key = self.key("baseline", &scoped);
        self.baselines.insert(scoped, stats.clone());
        match serde_json::to_value(&stats) {
            Ok(raw) => self.store_set(&key, raw, BASELINE_TTL).await,
            Err(e) => tracing::warn!(key, error = %e, "failed to serialize baseline"),
        }
    }

    /// All cached baselines for a domain, for the topology summary.
    pub fn baselines_for_domain(&self, domain: &str) -> Vec<(String, BaselineStats)> {
        let prefix = format!("{domain}:");
        self.baselines
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    // ---- policy Q-table ----

    async fn hydrate_policy(&self, domain: &str) {
        if self.policy.contains_key(domain) {
            return;
        }
        let key = self.key("policy", domain);
        let table = match self.store_get(&key).await {
            Some(raw) => serde_json::from_value::<HashMap<String, PolicyEntry>>(raw)
                .unwrap_or_default(),
            None => HashMap::new(),
        };
        self.policy.entry(domain.to_string()).or_insert(table);
    }

    pub async fn policy_entry(
        &self,
        domain: &str,
        state_hash: u32,
        action: PolicyAction,
    ) -> Option<PolicyEntry> {
        self.hydrate_policy(domain).await;
        let cell = format!("{state_hash}:{}", action.as_str());
        self.policy
            .get(domain)
            .and_then(|table| table.get(&cell).cloned())
    }

    /// Q-table rows for a domain, optionally narrowed to one state hash.
    pub async fn policy_entries(
        &self,
        domain: &str,
        state_hash: Option<u32>,
    ) -> Vec<PolicyEntry> {
        self.hydrate_policy(domain).await;
        let mut entries: Vec<PolicyEntry> = self
            .policy
            .get(domain)
            .map(|table| {
                table
                    .values()
                    .filter(|e| state_hash.map(|h| e.state_hash == h).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        entries
    }

    pub async fn upsert_policy(&self, entry: PolicyEntry) {
        self.hydrate_policy(&entry.domain).await;
        let domain = entry.domain.clone();
        let cell = format!("{}:{}", entry.state_hash, entry.action.as_str());
        let snapshot = {
            let mut table = self.policy.entry(domain.clone()).or_default();
            table.insert(cell, entry);
            table.clone()
        };
        let key = self.key("policy", &domain);
        match serde_json::to_value(&snapshot) {
            Ok(raw) => self.store_set(&key, raw, POLICY_TTL).await,
            Err(e) => tracing::warn!(key, error = %e, "failed to serialize policy table"),
        }
    }

    // ---- run records & history rings ----

    /// Persist a run record and append it to the per-domain and global
    /// history rings. The blackboard is the only mutator of those rings.
    pub async fn save_run(&self, run: &RunRecord) {
        self.runs.insert(run.run_id.clone(), run.clone());
        let key = self.key("run", &run.run_id);
        match serde_json::to_value(run) {
            Ok(raw) => self.store_set(&key, raw, RUN_TTL).await,
            Err(e) => tracing::warn!(key, error = %e, "failed to serialize run record"),
        }

        for scope in [run.domain.as_str(), "global"] {
            let snapshot = {
                let mut ring = self.history.entry(scope.to_string()).or_default();
                if ring.len() >= RUN_HISTORY_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(run.run_id.clone());
                ring.clone()
            };
            let key = self.key("runs", scope);
            match serde_json::to_value(&snapshot) {
                Ok(raw) => self.store_set(&key, raw, RUN_HISTORY_TTL).await,
                Err(e) => tracing::warn!(key, error = %e, "failed to serialize run history"),
            }
        }
    }

    /// Rewrite an already-saved run record without touching the history
    /// rings (used to finalize the persist phase of the trace).
    pub async fn update_run(&self, run: &RunRecord) {
        self.runs.insert(run.run_id.clone(), run.clone());
        let key = self.key("run", &run.run_id);
        match serde_json::to_value(run) {
            Ok(raw) => self.store_set(&key, raw, RUN_TTL).await,
            Err(e) => tracing::warn!(key, error = %e, "failed to serialize run record"),
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Option<RunRecord> {
        if let Some(run) = self.runs.get(run_id) {
            return Some(run.clone());
        }
        let key = self.key("run", run_id);
        let raw = self.store_get(&key).await?;
        let run = serde_json::from_value::<RunRecord>(raw).ok()?;
        self.runs.insert(run_id.to_string(), run.clone());
        Some(run)
    }

    async fn history_ring(&self, scope: &str) -> VecDeque<String> {
        if let Some(ring) = self.history.get(scope) {
            return ring.clone();
        }
        let key = self.key("runs", scope);
        if let Some(raw) = self.store_get(&key).await {
            if let Ok(ring) = serde_json::from_value::<VecDeque<String>>(raw) {
                self.history.entry(scope.to_string()).or_insert(ring.clone());
                return ring;
            }
        }
        VecDeque::new()
    }

    /// Run records newest-first from the domain ring (or the global ring).
    pub async fn list_runs(
        &self,
        domain: Option<&str>,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<RunRecord> {
        let scope = domain.unwrap_or("global");
        let ring = self.history_ring(scope).await;
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for run_id in ring.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let Some(run) = self.get_run(run_id).await else {
                continue;
            };
            if let Some(wanted) = status {
                if run.status != wanted {
                    continue;
                }
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push(run);
        }
        out
    }

    /// Newest run for a domain, regardless of status.
    pub async fn latest_run(&self, domain: &str) -> Option<RunRecord> {
        let ring = self.history_ring(domain).await;
        for run_id in ring.iter().rev() {
            if let Some(run) = self.get_run(run_id).await {
                return Some(run);
            }
        }
        None
    }

    // ---- analyst feedback ----

    pub async fn record_feedback(
        &self,
        source_id: &str,
        signal_type: &str,
        is_true_positive: bool,
        now: i64,
    ) {
        let scoped = format!("{source_id}:{signal_type}");
        let entry = FeedbackEntry {
            source_id: source_id.to_string(),
            signal_type: signal_type.to_string(),
            is_true_positive,
            recorded_at: now,
        };
        let snapshot = {
            let mut ring = self.feedback.entry(scoped.clone()).or_default();
            if ring.len() >= FEEDBACK_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(entry);
            ring.clone()
        };
        let key = self.key("feedback", &scoped);
        match serde_json::to_value(&snapshot) {
            Ok(raw) => self.store_set(&key, raw, FEEDBACK_TTL).await,
            Err(e) => tracing::warn!(key, error = %e, "failed to serialize feedback ring"),
        }
    }

    /// Round-trip probe against the backing store.
    pub async fn ping(&self) -> bool {
        let key = self.key("probe", "ping");
        self.store_set(&key, Value::from(1), DAY).await;
        self.store_get(&key).await.is_some()
    }
}
