use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::queue::QueueConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    All,
    Api,
    Worker,
}

impl Role {
    pub fn runs_api(self) -> bool {
        matches!(self, Role::All | Role::Api)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    Ollama,
    Hash,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub queue_database_path: String,
    pub upload_dir: String,
    pub max_upload_size: u64,
    pub ollama_url: String,
    pub embedding_model: String,
    pub embedding_backend: EmbeddingBackend,
    pub embed_timeout: Duration,
    pub worker_count: usize,
    pub role: Role,
    pub job_lease: Duration,
    pub reaper_interval: Duration,
    pub poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let role = match lookup("ANALYZER_ROLE").as_deref() {
            None | Some("all") => Role::All,
            Some("api") => Role::Api,
            Some("worker") => Role::Worker,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "ANALYZER_ROLE",
                    value: other.to_string(),
                })
            }
        };

        let embedding_backend = match lookup("EMBEDDING_BACKEND").as_deref() {
            None | Some("ollama") => EmbeddingBackend::Ollama,
            Some("hash") => EmbeddingBackend::Hash,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "EMBEDDING_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        Ok(Config {
            port: parse(&lookup, "PORT", 8000)?,
            database_path: string("DATABASE_PATH", "analyzer.db"),
            queue_database_path: string("QUEUE_DATABASE_PATH", "analyzer_queue.db"),
            upload_dir: string("UPLOAD_DIR", "uploads"),
            max_upload_size: parse(&lookup, "MAX_UPLOAD_SIZE", 10 * 1024 * 1024)?,
            ollama_url: string("OLLAMA_URL", "http://localhost:11434"),
            embedding_model: string("EMBEDDING_MODEL", "all-minilm"),
            embedding_backend,
            embed_timeout: Duration::from_secs(parse(&lookup, "EMBED_TIMEOUT_SECS", 60)?),
            worker_count: parse(&lookup, "WORKER_COUNT", 2)?,
            role,
            job_lease: Duration::from_secs(parse(&lookup, "JOB_LEASE_SECS", 300)?),
            reaper_interval: Duration::from_secs(parse(&lookup, "REAPER_INTERVAL_SECS", 60)?),
            poll_interval: Duration::from_millis(parse(&lookup, "POLL_INTERVAL_MS", 1000)?),
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            lease: self.job_lease,
            poll_interval: self.poll_interval,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
