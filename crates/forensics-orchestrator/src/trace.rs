//! Phase execution wrapper and the trace DAG recorder.

use forensics_core::{now_ms, ForensicsResult, PhaseStatus, PhaseTraceEntry};
use std::future::Future;

/// Records each executed phase with timings, status, and parent phases.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    entries: Vec<PhaseTraceEntry>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute one phase, recording its timings and outcome. The result is
    /// passed through untouched so the caller decides how failures
    /// propagate.
    pub async fn run_phase<T, F, Fut>(
        &mut self,
        phase: &str,
        parents: &[&str],
        body: F,
    ) -> ForensicsResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ForensicsResult<T>>,
    {
        let started_at = now_ms();
        tracing::debug!(phase, "phase started");
        let result = body().await;
        let completed_at = now_ms();

        let (status, error) = match &result {
            Ok(_) => (PhaseStatus::Success, None),
            Err(e) => (PhaseStatus::Failed, Some(e.to_string())),
        };
        let elapsed_ms = completed_at - started_at;
        tracing::debug!(phase, elapsed_ms, ?status, "phase finished");

        self.entries.push(PhaseTraceEntry {
            phase: phase.to_string(),
            status,
            started_at,
            completed_at,
            elapsed_ms,
            error,
            parent_phases: parents.iter().map(|p| p.to_string()).collect(),
        });
        result
    }

    /// Record a phase that never ran because an earlier phase failed.
    pub fn record_skipped(&mut self, phase: &str, parents: &[&str]) {
        let now = now_ms();
        self.entries.push(PhaseTraceEntry {
            phase: phase.to_string(),
            status: PhaseStatus::Skipped,
            started_at: now,
            completed_at: now,
            elapsed_ms: 0,
            error: None,
            parent_phases: parents.iter().map(|p| p.to_string()).collect(),
        });
    }

    /// Record a phase whose completion cannot be witnessed from inside the
    /// run (the persist write observes its own record).
    pub fn record_pending(&mut self, phase: &str, parents: &[&str]) {
        let now = now_ms();
        self.entries.push(PhaseTraceEntry {
            phase: phase.to_string(),
            status: PhaseStatus::Pending,
            started_at: now,
            completed_at: now,
            elapsed_ms: 0,
            error: None,
            parent_phases: parents.iter().map(|p| p.to_string()).collect(),
        });
    }

    /// Flip a previously recorded entry to a terminal status.
    pub fn finalize(&mut self, phase: &str, status: PhaseStatus) {
        if let Some(entry) = self.entries.iter_mut().rev().find(|e| e.phase == phase) {
            let now = now_ms();
            entry.status = status;
            entry.completed_at = now;
            entry.elapsed_ms = now - entry.started_at;
        }
    }

    /// Elapsed milliseconds of the most recent entry for a phase.
    pub fn elapsed_of(&self, phase: &str) -> i64 {
        self.entries
            .iter()
            .rev()
            .find(|e| e.phase == phase)
            .map(|e| e.elapsed_ms)
            .unwrap_or(0)
    }

    pub fn entries(&self) -> &[PhaseTraceEntry] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<PhaseTraceEntry> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forensics_core::ForensicsError;

    #[tokio::test]
    async fn successful_phase_recorded() {
        let mut trace = TraceRecorder::new();
        let out = trace
            .run_phase("ingest-signals", &[], || async { Ok(41 + 1) })
            .await
            .unwrap();
        assert_eq!(out, 42);

        let entry = &trace.entries()[0];
        assert_eq!(entry.phase, "ingest-signals");
        assert_eq!(entry.status, PhaseStatus::Success);
        assert!(entry.parent_phases.is_empty());
        assert!(entry.completed_at >= entry.started_at);
        assert!(entry.error.is_none());
    }

    #[tokio::test]
    async fn failed_phase_records_error_text() {
        let mut trace = TraceRecorder::new();
        let out: ForensicsResult<()> = trace
            .run_phase("weak-supervision-fusion", &["policy-select"], || async {
                Err(ForensicsError::PhaseFailure {
                    phase: "weak-supervision-fusion".to_string(),
                    message: "labeler matrix degenerate".to_string(),
                })
            })
            .await;
        assert!(out.is_err());

        let entry = &trace.entries()[0];
        assert_eq!(entry.status, PhaseStatus::Failed);
        assert!(entry.error.as_ref().unwrap().contains("labeler matrix"));
        assert_eq!(entry.parent_phases, vec!["policy-select".to_string()]);
    }

    #[tokio::test]
    async fn skipped_and_pending_entries() {
        let mut trace = TraceRecorder::new();
        trace.record_skipped("conformal-anomaly", &["policy-select"]);
        trace.record_pending("persist-results", &["weak-supervision-fusion"]);
        assert_eq!(trace.entries()[0].status, PhaseStatus::Skipped);
        assert_eq!(trace.entries()[1].status, PhaseStatus::Pending);

        trace.finalize("persist-results", PhaseStatus::Success);
        assert_eq!(trace.entries()[1].status, PhaseStatus::Success);
    }
}
