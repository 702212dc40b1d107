//! Signal Ingestor / Normalizer
//!
//! Validates weakly typed signal payloads and fills defaults, producing the
//! immutable [`Signal`] batch every downstream engine consumes. Rejections
//! happen here, once, so the engines never re-validate.

use forensics_core::Signal;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Default domain when neither the signal nor the request carries one.
pub const DEFAULT_DOMAIN: &str = "infrastructure";

/// Default region for signals that do not carry one.
pub const DEFAULT_REGION: &str = "global";

/// A signal as it arrives on the wire: every field optional, nothing trusted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSignal {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub signal_type: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub observed_at: Option<i64>,
    #[serde(default)]
    pub evidence_ids: Option<Vec<String>>,
}

/// Validate one raw signal and fill defaults. Returns `None` on rejection.
pub fn normalize(raw: &RawSignal, request_domain: &str, now: i64) -> Option<Signal> {
    let source_id = raw.source_id.as_deref().unwrap_or("").trim();
    let signal_type = raw.signal_type.as_deref().unwrap_or("").trim();
    let value = raw.value?;

    if source_id.is_empty() || signal_type.is_empty() || !value.is_finite() {
        tracing::debug!(
            source_id,
            signal_type,
            "rejected signal: missing identity or non-finite value"
        );
        return None;
    }

    let domain = raw
        .domain
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(if request_domain.is_empty() {
            DEFAULT_DOMAIN
        } else {
            request_domain
        });

    let region = raw
        .region
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REGION);

    let confidence = match raw.confidence {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => 1.0,
    };

    let observed_at = match raw.observed_at {
        Some(ts) if ts > 0 => ts,
        _ => now,
    };

    let evidence_ids: BTreeSet<String> = raw
        .evidence_ids
        .iter()
        .flatten()
        .filter(|e| !e.trim().is_empty())
        .map(|e| e.trim().to_string())
        .collect();

    Some(Signal {
        source_id: source_id.to_string(),
        region: region.to_string(),
        domain: domain.to_string(),
        signal_type: signal_type.to_string(),
        value,
        confidence,
        observed_at,
        evidence_ids,
    })
}

/// Normalize a batch, preserving input order and dropping rejects.
pub fn normalize_batch<'a>(
    raw: &'a [RawSignal],
    request_domain: &'a str,
    now: i64,
) -> impl Iterator<Item = Signal> + 'a {
    raw.iter().filter_map(move |r| normalize(r, request_domain, now))
}

/// Expand request-level evidence identifiers into pattern-of-life marker
/// signals so evidence-only requests still reach the fusion pass.
pub fn evidence_signals(evidence_ids: &[String], domain: &str, now: i64) -> Vec<Signal> {
    evidence_ids
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .map(|e| Signal {
            source_id: format!("evidence:{e}"),
            region: DEFAULT_REGION.to_string(),
            domain: if domain.is_empty() {
                DEFAULT_DOMAIN.to_string()
            } else {
                domain.to_string()
            },
            signal_type: "pattern_of_life".to_string(),
            value: 1.0,
            confidence: 0.5,
            observed_at: now,
            evidence_ids: std::iter::once(e.to_string()).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(source: &str, signal_type: &str, value: f64) -> RawSignal {
        RawSignal {
            source_id: Some(source.to_string()),
            signal_type: Some(signal_type.to_string()),
            value: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn fills_defaults() {
        let signal = normalize(&raw("corridor-7", "ais_silence", 3.2), "maritime", 1_000).unwrap();
        assert_eq!(signal.region, "global");
        assert_eq!(signal.domain, "maritime");
        assert_eq!(signal.confidence, 1.0);
        assert_eq!(signal.observed_at, 1_000);
    }

    #[test]
    fn falls_back_to_infrastructure_domain() {
        let signal = normalize(&raw("s1", "t1", 1.0), "", 1).unwrap();
        assert_eq!(signal.domain, "infrastructure");
    }

    #[test]
    fn rejects_missing_identity_and_nonfinite_values() {
        assert!(normalize(&raw("", "t1", 1.0), "d", 1).is_none());
        assert!(normalize(&raw("s1", "", 1.0), "d", 1).is_none());
        assert!(normalize(&raw("s1", "t1", f64::NAN), "d", 1).is_none());
        assert!(normalize(
            &RawSignal {
                source_id: Some("s1".into()),
                signal_type: Some("t1".into()),
                value: None,
                ..Default::default()
            },
            "d",
            1
        )
        .is_none());
    }

    #[test]
    fn clamps_confidence_and_repairs_timestamp() {
        let mut r = raw("s1", "t1", 5.0);
        r.confidence = Some(7.0);
        r.observed_at = Some(-3);
        let signal = normalize(&r, "d", 42).unwrap();
        assert_eq!(signal.confidence, 1.0);
        assert_eq!(signal.observed_at, 42);

        r.confidence = Some(f64::NAN);
        assert_eq!(normalize(&r, "d", 42).unwrap().confidence, 1.0);

        r.confidence = Some(-0.2);
        assert_eq!(normalize(&r, "d", 42).unwrap().confidence, 0.0);
    }

    #[test]
    fn batch_preserves_order_and_drops_rejects() {
        let batch = vec![raw("a", "t", 1.0), raw("", "t", 2.0), raw("b", "t", 3.0)];
        let out: Vec<_> = normalize_batch(&batch, "d", 1).collect();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].source_id, "a");
        assert_eq!(out[1].source_id, "b");
    }

    #[test]
    fn evidence_expansion() {
        let out = evidence_signals(&["e1".into(), " ".into(), "e2".into()], "osint", 9);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].source_id, "evidence:e1");
        assert_eq!(out[0].signal_type, "pattern_of_life");
        assert!(out[0].evidence_ids.contains("e1"));
    }
}
