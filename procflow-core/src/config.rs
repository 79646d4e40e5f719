use chrono::Duration;
use serde::Deserialize;

/// Engine and scheduler tuning knobs. Deserializable so embedders can load
/// it from their own config files.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an acquired job stays locked before a crashed worker's lock
    /// is reclaimable.
    pub job_lock_duration_ms: u64,
    /// Scheduler poll interval between acquisition rounds.
    pub worker_poll_interval_ms: u64,
    /// Jobs acquired per round, per worker.
    pub job_batch_size: usize,
    /// Retry budget for newly created jobs.
    pub default_job_retries: u32,
    /// Base of the exponential retry backoff.
    pub retry_backoff_base_ms: u64,
    /// Runaway guard: a command applying more operations than this aborts.
    pub max_operations_per_command: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_lock_duration_ms: 5 * 60 * 1_000,
            worker_poll_interval_ms: 500,
            job_batch_size: 10,
            default_job_retries: 3,
            retry_backoff_base_ms: 10_000,
            max_operations_per_command: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn job_lock_duration(&self) -> Duration {
        Duration::milliseconds(self.job_lock_duration_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"default_job_retries": 7}"#).unwrap();
        assert_eq!(cfg.default_job_retries, 7);
        assert_eq!(cfg.job_batch_size, EngineConfig::default().job_batch_size);
    }
}
