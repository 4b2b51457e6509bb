// Worker process settings, read from the environment

use crate::redis::{queue_name, JOBS_QUEUE, RESULTS_QUEUE};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// Number of independent queue consumers
    pub concurrency: usize,
    pub job_queue: String,
    pub result_queue: String,
    pub languages_config: String,
    pub pop_timeout: Duration,
    pub acquire_timeout: Duration,
    pub case_settle_delay: Duration,
    /// Empty disables the health endpoint
    pub health_addr: String,
    pub json_logs: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            concurrency: 5,
            job_queue: queue_name(JOBS_QUEUE),
            result_queue: queue_name(RESULTS_QUEUE),
            languages_config: "config/languages.json".to_string(),
            pop_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_millis(30_000),
            case_settle_delay: Duration::from_millis(50),
            health_addr: "0.0.0.0:8080".to_string(),
            json_logs: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            concurrency: number("WORKER_CONCURRENCY")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.concurrency),
            job_queue: lookup("JOB_QUEUE").unwrap_or(defaults.job_queue),
            result_queue: lookup("RESULT_QUEUE").unwrap_or(defaults.result_queue),
            languages_config: lookup("LANGUAGES_CONFIG").unwrap_or(defaults.languages_config),
            pop_timeout: number("QUEUE_POP_TIMEOUT_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.pop_timeout),
            acquire_timeout: number("ACQUIRE_TIMEOUT_MS")
                .filter(|n| *n > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_timeout),
            case_settle_delay: number("CASE_SETTLE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.case_settle_delay),
            health_addr: lookup("HEALTH_ADDR").unwrap_or(defaults.health_addr),
            json_logs: lookup("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(defaults.json_logs),
        }
    }
}
