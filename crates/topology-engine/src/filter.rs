use forensics_core::Signal;

const FINANCIAL_DOMAINS: &[&str] = &["market", "prediction", "finance", "economic"];

const FINANCIAL_SOURCE_PREFIXES: &[&str] = &["market:", "prediction:"];

const FINANCIAL_TYPE_HINTS: &[&str] = &[
    "market",
    "prediction",
    "volatility",
    "conviction",
    "etf",
    "flow",
    "yield",
    "spread",
    "commodity",
    "fx",
];

/// Whether a signal belongs to the financial correlation graph.
pub fn is_financial(signal: &Signal) -> bool {
    let domain = signal.domain.to_lowercase();
    if FINANCIAL_DOMAINS.contains(&domain.as_str()) {
        return true;
    }
    let source = signal.source_id.to_lowercase();
    if FINANCIAL_SOURCE_PREFIXES
        .iter()
        .any(|p| source.starts_with(p))
    {
        return true;
    }
    let signal_type = signal.signal_type.to_lowercase();
    FINANCIAL_TYPE_HINTS
        .iter()
        .any(|hint| signal_type.contains(hint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn signal(domain: &str, source: &str, signal_type: &str) -> Signal {
        Signal {
            source_id: source.to_string(),
            region: "global".to_string(),
            domain: domain.to_string(),
            signal_type: signal_type.to_string(),
            value: 1.0,
            confidence: 1.0,
            observed_at: 1,
            evidence_ids: BTreeSet::new(),
        }
    }

    #[test]
    fn financial_by_domain() {
        assert!(is_financial(&signal("market", "s", "anything")));
        assert!(is_financial(&signal("economic", "s", "anything")));
        assert!(!is_financial(&signal("maritime", "s", "ais_silence")));
    }

    #[test]
    fn financial_by_source_prefix() {
        assert!(is_financial(&signal("infrastructure", "market:SPY", "t")));
        assert!(is_financial(&signal("infrastructure", "prediction:rates", "t")));
    }

    #[test]
    fn financial_by_type_hint() {
        assert!(is_financial(&signal("infrastructure", "s", "implied_volatility")));
        assert!(is_financial(&signal("infrastructure", "s", "etf_flow")));
        assert!(!is_financial(&signal("infrastructure", "s", "outage_count")));
    }
}
