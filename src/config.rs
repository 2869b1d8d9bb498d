use std::env;
use std::time::Duration;

/// How worker self-reinvocations are carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerDispatch {
    /// In-process dispatch loop; the default for single-node runs.
    Channel,
    /// Fire-and-forget POST to the worker entry point, for replicas sharing
    /// one Redis.
    Http,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// When unset, the in-memory store backs the service.
    pub redis_url: Option<String>,
    pub public_base_url: String,
    pub worker_dispatch: WorkerDispatch,
    /// Deadline applied to every KV operation.
    pub kv_op_timeout: Duration,
    /// TTL for all per-job keys.
    pub job_ttl: Duration,
    /// Wall-clock margin kept before an invocation's hard deadline.
    pub reinvoke_margin: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidValue("PORT", "must be a valid u16"))?;

        let redis_url = env::var("REDIS_URL").ok().filter(|v| !v.is_empty());

        let public_base_url =
            env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| format!("http://localhost:{port}"));

        let worker_dispatch = match env::var("WORKER_DISPATCH").as_deref() {
            Ok("http") => WorkerDispatch::Http,
            Ok("channel") | Err(_) => WorkerDispatch::Channel,
            Ok(_) => {
                return Err(ConfigError::InvalidValue(
                    "WORKER_DISPATCH",
                    "must be \"channel\" or \"http\"",
                ))
            }
        };

        let kv_op_timeout_ms = env::var("KV_OP_TIMEOUT_MS")
            .unwrap_or_else(|_| "2000".to_string())
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue("KV_OP_TIMEOUT_MS", "must be a valid u64"))?;

        let job_ttl_secs = env::var("JOB_TTL_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue("JOB_TTL_SECS", "must be a valid u64"))?;

        let reinvoke_margin_secs = env::var("REINVOKE_MARGIN_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue("REINVOKE_MARGIN_SECS", "must be a valid u64")
            })?;

        Ok(Config {
            port,
            redis_url,
            public_base_url,
            worker_dispatch,
            kv_op_timeout: Duration::from_millis(kv_op_timeout_ms),
            job_ttl: Duration::from_secs(job_ttl_secs),
            reinvoke_margin: Duration::from_secs(reinvoke_margin_secs),
        })
    }

    /// Defaults for tests and embedded use; no environment required.
    pub fn for_tests() -> Self {
        Config {
            port: 0,
            redis_url: None,
            public_base_url: "http://localhost:8080".to_string(),
            worker_dispatch: WorkerDispatch::Channel,
            kv_op_timeout: Duration::from_secs(2),
            job_ttl: Duration::from_secs(86400),
            reinvoke_margin: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}
