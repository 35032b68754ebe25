//! Process configuration read once at startup

use crate::generation::GenerationPolicy;
use crate::runtime::{StoreRetry, WorkerSettings};
use std::str::FromStr;
use std::time::Duration;

/// Service configuration; provider credentials live in `LlmConfig`
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub db_path: String,
    pub port: u16,
    /// Conversations idle for longer than this are swept
    pub retention: chrono::Duration,
    pub sweep_interval: Duration,
    pub generation: GenerationPolicy,
    pub store_retry: StoreRetry,
    pub workers: WorkerSettings,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset or unparsable values fall back
    /// to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |name: &str, default: u64| parse_or(&lookup, name, default);

        let db_path = lookup("CHATFLOW_DB_PATH").unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            format!("{home}/.chatflow/chatflow.db")
        });

        let port = parse_or(&lookup, "CHATFLOW_PORT", 8000u16);
        let retention_days = parsed("CHATFLOW_RETENTION_DAYS", 7);
        let sweep_secs = parsed("CHATFLOW_SWEEP_INTERVAL_SECS", 3600);

        let defaults = GenerationPolicy::default();
        let generation = GenerationPolicy {
            max_attempts: parse_or(&lookup, "CHATFLOW_GEN_MAX_ATTEMPTS", defaults.max_attempts)
                .max(1),
            timeout_budget: parse_or(&lookup, "CHATFLOW_GEN_TIMEOUT_BUDGET", defaults.timeout_budget)
                .max(1),
            attempt_timeout: Duration::from_secs(
                parsed(
                    "CHATFLOW_GEN_ATTEMPT_TIMEOUT_SECS",
                    defaults.attempt_timeout.as_secs(),
                )
                .max(1),
            ),
            backoff: defaults.backoff,
        };

        let store_defaults = StoreRetry::default();
        let store_retry = StoreRetry::new(
            parse_or(&lookup, "CHATFLOW_STORE_RETRIES", store_defaults.attempts),
            store_defaults.backoff,
        );

        let workers = WorkerSettings {
            idle_timeout: Duration::from_secs(parsed(
                "CHATFLOW_WORKER_IDLE_SECS",
                WorkerSettings::default().idle_timeout.as_secs(),
            )),
            ..WorkerSettings::default()
        };

        Self {
            db_path,
            port,
            retention: chrono::Duration::days(i64::try_from(retention_days.min(36_500)).unwrap_or(7)),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            generation,
            store_retry,
            workers,
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(name, value = %raw, "Ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("HOME", "/home/chef")]);
        assert_eq!(config.db_path, "/home/chef/.chatflow/chatflow.db");
        assert_eq!(config.port, 8000);
        assert_eq!(config.retention, chrono::Duration::days(7));
        assert_eq!(config.generation, GenerationPolicy::default());
        assert_eq!(config.store_retry, StoreRetry::default());
        assert_eq!(config.workers.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("CHATFLOW_DB_PATH", "/data/flows.db"),
            ("CHATFLOW_PORT", "9100"),
            ("CHATFLOW_GEN_MAX_ATTEMPTS", "5"),
            ("CHATFLOW_GEN_TIMEOUT_BUDGET", "2"),
            ("CHATFLOW_GEN_ATTEMPT_TIMEOUT_SECS", "20"),
            ("CHATFLOW_RETENTION_DAYS", "1"),
        ]);
        assert_eq!(config.db_path, "/data/flows.db");
        assert_eq!(config.port, 9100);
        assert_eq!(config.generation.max_attempts, 5);
        assert_eq!(config.generation.timeout_budget, 2);
        assert_eq!(config.generation.attempt_timeout, Duration::from_secs(20));
        assert_eq!(config.retention, chrono::Duration::days(1));
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = config(&[("CHATFLOW_PORT", "eighty"), ("CHATFLOW_GEN_MAX_ATTEMPTS", "0")]);
        assert_eq!(config.port, 8000);
        assert_eq!(config.generation.max_attempts, 1);
    }
}
