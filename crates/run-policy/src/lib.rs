//! Run Policy (tabular Q-learning over phase ordering)
//!
//! The pipeline has exactly two analysis phases and one degree of freedom:
//! which runs first. A tiny Q-table keyed by a hashed request state learns
//! which ordering pays off (finishes fast, yields rows) per domain, with
//! epsilon-greedy exploration to keep the estimates honest.

use blackboard::Blackboard;
use forensics_core::{ForensicsConfig, PolicyAction, PolicyEntry, Signal};
use rand::Rng;
use std::collections::BTreeSet;

/// FNV-1a 32-bit hash.
pub fn fnv1a32(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Hash the request state the policy conditions on: domain, alpha, batch
/// size band, and the leading signal types and regions.
pub fn state_hash(domain: &str, alpha: f64, signals: &[Signal]) -> u32 {
    let n = signals.len();
    let band = (n / 10).min(8);

    let types: Vec<&str> = signals
        .iter()
        .map(|s| s.signal_type.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(10)
        .collect();
    let regions: Vec<&str> = signals
        .iter()
        .map(|s| s.region.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(10)
        .collect();

    let key = format!(
        "{domain}|a:{alpha:.3}|n:{n}|nb:{band}|t:{}|r:{}",
        types.join(","),
        regions.join(",")
    );
    fnv1a32(&key)
}

/// Source of exploration randomness; injected so tests can pin decisions.
pub trait Exploration: Send + Sync {
    /// Uniform draw in [0, 1).
    fn roll(&self) -> f64;
}

/// Production exploration backed by the thread RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngExploration;

impl Exploration for ThreadRngExploration {
    fn roll(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Never explores; used by tests and when determinism matters more than
/// regret.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExploration;

impl Exploration for NoExploration {
    fn roll(&self) -> f64 {
        1.0
    }
}

const FIXED_ORDER: [PolicyAction; 2] = [
    PolicyAction::WeakSupervisionFusion,
    PolicyAction::ConformalAnomaly,
];

/// Choose the analysis-phase ordering for a state. Fixed order when the
/// dynamic policy is disabled; otherwise epsilon-greedy over the Q-table
/// with ties broken in favor of fusion.
pub async fn select_order(
    board: &Blackboard,
    config: &ForensicsConfig,
    domain: &str,
    hash: u32,
    exploration: &dyn Exploration,
) -> [PolicyAction; 2] {
    if !config.dynamic_policy_enabled {
        return FIXED_ORDER;
    }

    if exploration.roll() < config.policy_epsilon {
        let order = if exploration.roll() < 0.5 {
            [
                PolicyAction::ConformalAnomaly,
                PolicyAction::WeakSupervisionFusion,
            ]
        } else {
            FIXED_ORDER
        };
        tracing::debug!(domain, hash, first = order[0].as_str(), "exploring phase order");
        return order;
    }

    let q_fusion = board
        .policy_entry(domain, hash, PolicyAction::WeakSupervisionFusion)
        .await
        .map(|e| e.q_value)
        .unwrap_or(0.0);
    let q_anomaly = board
        .policy_entry(domain, hash, PolicyAction::ConformalAnomaly)
        .await
        .map(|e| e.q_value)
        .unwrap_or(0.0);

    if q_anomaly > q_fusion {
        [
            PolicyAction::ConformalAnomaly,
            PolicyAction::WeakSupervisionFusion,
        ]
    } else {
        FIXED_ORDER
    }
}

/// Reward for a completed phase: latency-discounted log yield on success,
/// a flat penalty on failure.
pub fn phase_reward(success: bool, output_rows: usize, elapsed_ms: i64) -> f64 {
    if !success {
        return -1.0;
    }
    let elapsed_s = (elapsed_ms as f64 / 1000.0).max(0.1);
    1.0 + (output_rows as f64).ln_1p() / (elapsed_s + 1.0).ln_1p()
}

/// One-step Q update for a `(state, action)` cell, persisted through the
/// blackboard. No-op when policy learning is disabled.
pub async fn apply_update(
    board: &Blackboard,
    config: &ForensicsConfig,
    domain: &str,
    hash: u32,
    action: PolicyAction,
    reward: f64,
    now: i64,
) {
    if !config.policy_learning_enabled {
        return;
    }

    let previous = board.policy_entry(domain, hash, action).await;
    let (q_value, visit_count) = previous
        .map(|e| (e.q_value, e.visit_count))
        .unwrap_or((0.0, 0));

    let learning_rate = config.policy_learning_rate;
    let updated = PolicyEntry {
        domain: domain.to_string(),
        state_hash: hash,
        action,
        q_value: q_value + learning_rate * (reward - q_value),
        visit_count: visit_count + 1,
        last_reward: reward,
        last_updated: now,
    };

    tracing::debug!(
        domain,
        hash,
        action = action.as_str(),
        q = updated.q_value,
        reward,
        "policy updated"
    );
    board.upsert_policy(updated).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRoll(f64);
    impl Exploration for FixedRoll {
        fn roll(&self) -> f64 {
            self.0
        }
    }

    fn signal(signal_type: &str, region: &str) -> Signal {
        Signal {
            source_id: "s".to_string(),
            region: region.to_string(),
            domain: "d".to_string(),
            signal_type: signal_type.to_string(),
            value: 1.0,
            confidence: 1.0,
            observed_at: 1,
            evidence_ids: BTreeSet::new(),
        }
    }

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(fnv1a32(""), 0x811c_9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c_292c);
    }

    #[test]
    fn state_hash_sensitive_to_inputs() {
        let batch = vec![signal("t1", "r1"), signal("t2", "r2")];
        let base = state_hash("d", 0.05, &batch);
        assert_eq!(base, state_hash("d", 0.05, &batch));
        assert_ne!(base, state_hash("other", 0.05, &batch));
        assert_ne!(base, state_hash("d", 0.01, &batch));
        assert_ne!(base, state_hash("d", 0.05, &batch[..1]));
    }

    #[test]
    fn state_hash_ignores_signal_order() {
        let forward = vec![signal("t1", "r1"), signal("t2", "r2")];
        let backward = vec![signal("t2", "r2"), signal("t1", "r1")];
        assert_eq!(
            state_hash("d", 0.05, &forward),
            state_hash("d", 0.05, &backward)
        );
    }

    #[tokio::test]
    async fn fixed_order_when_dynamic_disabled() {
        let board = Blackboard::in_memory("test");
        let mut config = ForensicsConfig::for_tests();
        config.dynamic_policy_enabled = false;
        let order = select_order(&board, &config, "d", 1, &FixedRoll(0.0)).await;
        assert_eq!(order[0], PolicyAction::WeakSupervisionFusion);
    }

    #[tokio::test]
    async fn greedy_selection_prefers_higher_q() {
        let board = Blackboard::in_memory("test");
        let config = ForensicsConfig::for_tests();
        let hash = 99;

        // Ties (both absent) favor fusion.
        let order = select_order(&board, &config, "d", hash, &NoExploration).await;
        assert_eq!(order[0], PolicyAction::WeakSupervisionFusion);

        apply_update(
            &board,
            &config,
            "d",
            hash,
            PolicyAction::ConformalAnomaly,
            2.0,
            1,
        )
        .await;
        let order = select_order(&board, &config, "d", hash, &NoExploration).await;
        assert_eq!(order[0], PolicyAction::ConformalAnomaly);
        assert_eq!(order[1], PolicyAction::WeakSupervisionFusion);
    }

    #[tokio::test]
    async fn exploration_can_flip_order() {
        let board = Blackboard::in_memory("test");
        let mut config = ForensicsConfig::for_tests();
        config.policy_epsilon = 1.0;
        // roll() = 0.0 takes the exploration branch, then the flipped permutation.
        let order = select_order(&board, &config, "d", 1, &FixedRoll(0.0)).await;
        assert_eq!(order[0], PolicyAction::ConformalAnomaly);
    }

    #[test]
    fn reward_shapes() {
        assert_eq!(phase_reward(false, 100, 10), -1.0);

        // Zero rows: flat success reward.
        assert!((phase_reward(true, 0, 500) - 1.0).abs() < 1e-12);

        // More rows in the same time is better.
        assert!(phase_reward(true, 100, 500) > phase_reward(true, 10, 500));

        // Same rows slower is worse.
        assert!(phase_reward(true, 100, 5_000) < phase_reward(true, 100, 500));

        // Sub-100ms phases clamp to the 0.1 s floor.
        assert!(
            (phase_reward(true, 10, 0) - phase_reward(true, 10, 100)).abs() < 1e-12
        );
    }

    #[tokio::test]
    async fn q_update_moves_toward_reward() {
        let board = Blackboard::in_memory("test");
        let config = ForensicsConfig::for_tests();

        apply_update(&board, &config, "d", 5, PolicyAction::WeakSupervisionFusion, 2.0, 10).await;
        let entry = board
            .policy_entry("d", 5, PolicyAction::WeakSupervisionFusion)
            .await
            .unwrap();
        assert!((entry.q_value - 0.4).abs() < 1e-12); // 0 + 0.2 * (2 - 0)
        assert_eq!(entry.visit_count, 1);
        assert_eq!(entry.last_reward, 2.0);

        apply_update(&board, &config, "d", 5, PolicyAction::WeakSupervisionFusion, 2.0, 20).await;
        let entry = board
            .policy_entry("d", 5, PolicyAction::WeakSupervisionFusion)
            .await
            .unwrap();
        assert!((entry.q_value - 0.72).abs() < 1e-12); // 0.4 + 0.2 * 1.6
        assert_eq!(entry.visit_count, 2);
        assert_eq!(entry.last_updated, 20);
    }

    #[tokio::test]
    async fn learning_disabled_is_a_noop() {
        let board = Blackboard::in_memory("test");
        let mut config = ForensicsConfig::for_tests();
        config.policy_learning_enabled = false;
        apply_update(&board, &config, "d", 5, PolicyAction::ConformalAnomaly, 2.0, 10).await;
        assert!(board
            .policy_entry("d", 5, PolicyAction::ConformalAnomaly)
            .await
            .is_none());
    }
}
