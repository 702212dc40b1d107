/// Pipeline configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct ForensicsConfig {
    /// Enables worker offload for the analysis phases when non-empty.
    pub worker_url: Option<String>,
    /// Sent as `X-Forensics-Worker-Secret` on worker calls when set.
    pub worker_shared_secret: Option<String>,
    pub dynamic_policy_enabled: bool,
    pub policy_learning_enabled: bool,
    /// Exploration probability, clamped to [0, 1].
    pub policy_epsilon: f64,
    /// Q-update step size, clamped to [0.01, 1].
    pub policy_learning_rate: f64,
    /// Redis backing store; the in-memory store is used when unset.
    pub redis_url: Option<String>,
    pub bind_addr: String,
    /// Prefix for every persisted key, isolating environments that share a store.
    pub environment_prefix: String,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

impl Default for ForensicsConfig {
    fn default() -> Self {
        Self {
            worker_url: env_nonempty("FORENSICS_WORKER_URL"),
            worker_shared_secret: env_nonempty("FORENSICS_WORKER_SECRET"),
            dynamic_policy_enabled: env_bool("FORENSICS_DYNAMIC_POLICY", true),
            policy_learning_enabled: env_bool("FORENSICS_POLICY_LEARNING", true),
            policy_epsilon: env_f64("FORENSICS_POLICY_EPSILON", 0.15).clamp(0.0, 1.0),
            policy_learning_rate: env_f64("FORENSICS_POLICY_LEARNING_RATE", 0.2)
                .clamp(0.01, 1.0),
            redis_url: env_nonempty("FORENSICS_REDIS_URL"),
            bind_addr: std::env::var("FORENSICS_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8700".to_string()),
            environment_prefix: std::env::var("FORENSICS_ENV_PREFIX")
                .unwrap_or_else(|_| "forensics".to_string()),
        }
    }
}

impl ForensicsConfig {
    /// Configuration for tests: no worker, no redis, no exploration.
    pub fn for_tests() -> Self {
        Self {
            worker_url: None,
            worker_shared_secret: None,
            dynamic_policy_enabled: true,
            policy_learning_enabled: true,
            policy_epsilon: 0.0,
            policy_learning_rate: 0.2,
            redis_url: None,
            bind_addr: "127.0.0.1:0".to_string(),
            environment_prefix: "test".to_string(),
        }
    }
}
