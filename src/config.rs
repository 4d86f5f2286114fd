//! Environment-driven configuration.
//!
//! Values resolve in order (later wins): compiled defaults, `.env` file,
//! process environment. Every variable parses into a typed field; a value
//! that fails to parse is a startup error naming the offending key.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is absent.
    #[error("missing required environment variable {key}")]
    MissingVar { key: &'static str },

    /// An environment variable is present but unparseable.
    #[error("failed to parse environment variable {key}: {message}")]
    EnvParse { key: &'static str, message: String },
}

/// Which storage backend the data layer talks to.
///
/// `Rest` is the production path; `Memory` runs the whole server in-process
/// with no external engine, for local development and the test suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Rest,
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub timeout: Duration,
    pub model_name: String,
    pub dimension: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub metrics_enabled: bool,
    pub monitoring_enabled: bool,
    pub slow_query_threshold: Duration,
    pub consistency_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Fan-out width inside one submission (embedding batches, extraction).
    pub worker_width: usize,
    /// Bound on concurrently processed submissions across the server.
    pub max_jobs: usize,
    /// Texts per embedding API call; the client splits past this anyway.
    pub embed_batch_size: usize,
    /// Re-queue attempts for a failed embedding batch.
    pub batch_retries: u32,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Aggregate server configuration. The recognized environment variables
/// are listed in the README.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub monitoring: MonitoringConfig,
    pub ingest: IngestConfig,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8080,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            storage: StorageConfig {
                kind: StorageKind::Memory,
                url: None,
                api_key: None,
            },
            llm: LlmConfig {
                api_key: None,
                endpoint: None,
                timeout: Duration::from_secs(60),
            },
            embedding: EmbeddingConfig {
                api_key: None,
                endpoint: None,
                timeout: Duration::from_secs(30),
                model_name: "text-embedding-3-small".to_string(),
                dimension: 1536,
            },
            cache: CacheConfig {
                enabled: true,
                max_entries: 1000,
                default_ttl: Duration::from_secs(30 * 60),
                cleanup_interval: Duration::from_secs(5 * 60),
            },
            monitoring: MonitoringConfig {
                metrics_enabled: true,
                monitoring_enabled: true,
                slow_query_threshold: Duration::from_millis(500),
                consistency_interval: Duration::from_secs(15 * 60),
            },
            ingest: IngestConfig {
                worker_width: 4,
                max_jobs: 8,
                embed_batch_size: 100,
                batch_retries: 3,
            },
            log: LogConfig {
                level: "info".to_string(),
                format: LogFormat::Json,
            },
        }
    }
}

impl ServerConfig {
    /// Resolves configuration from `.env` and the process environment on
    /// top of compiled defaults. Shorthand for
    /// [`ConfigBuilder::new().with_env().build()`](ConfigBuilder).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable fails to parse, or when the
    /// REST storage backend is selected without `STORAGE_URL` /
    /// `STORAGE_API_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        ConfigBuilder::new().with_env().build()
    }
}

/// Builder for [`ServerConfig`]: compiled defaults, optionally overlaid
/// with `.env` and process-environment variables.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    base: ServerConfig,
    use_env: bool,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        ConfigBuilder {
            base: ServerConfig::default(),
            use_env: false,
        }
    }

    /// Starts from an explicit base instead of the compiled defaults.
    #[must_use]
    pub fn with_base(mut self, base: ServerConfig) -> Self {
        self.base = base;
        self
    }

    /// Enables the environment overlay (`.env` file first, then the
    /// process environment).
    #[must_use]
    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    /// Builds the final configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an environment variable fails to
    /// parse, or when the resolved configuration selects the REST storage
    /// backend without `STORAGE_URL` / `STORAGE_API_KEY`.
    pub fn build(mut self) -> Result<ServerConfig, ConfigError> {
        if self.use_env {
            dotenvy::dotenv().ok();
            apply_env(&mut self.base)?;
        }

        if self.base.storage.kind == StorageKind::Rest {
            if self.base.storage.url.is_none() {
                return Err(ConfigError::MissingVar { key: "STORAGE_URL" });
            }
            if self.base.storage.api_key.is_none() {
                return Err(ConfigError::MissingVar {
                    key: "STORAGE_API_KEY",
                });
            }
        }
        Ok(self.base)
    }
}

fn apply_env(cfg: &mut ServerConfig) -> Result<(), ConfigError> {
    if let Some(port) = read_parsed::<u16>("SERVER_PORT")? {
        cfg.port = port;
    }
    if let Some(d) = read_duration("SERVER_READ_TIMEOUT")? {
        cfg.read_timeout = d;
    }
    if let Some(d) = read_duration("SERVER_WRITE_TIMEOUT")? {
        cfg.write_timeout = d;
    }

    cfg.storage.url = read_string("STORAGE_URL");
    cfg.storage.api_key = read_string("STORAGE_API_KEY");
    cfg.storage.kind = match read_string("STORAGE_BACKEND").as_deref() {
        Some("memory") => StorageKind::Memory,
        Some("rest") => StorageKind::Rest,
        Some(other) => {
            return Err(ConfigError::EnvParse {
                key: "STORAGE_BACKEND",
                message: format!("must be 'rest' or 'memory', got '{other}'"),
            });
        }
        // REST when an engine URL is configured, in-memory otherwise.
        None => {
            if cfg.storage.url.is_some() {
                StorageKind::Rest
            } else {
                StorageKind::Memory
            }
        }
    };

    cfg.llm.api_key = read_string("LLM_API_KEY");
    cfg.llm.endpoint = read_string("LLM_ENDPOINT");
    if let Some(d) = read_duration("LLM_TIMEOUT")? {
        cfg.llm.timeout = d;
    }

    cfg.embedding.api_key = read_string("EMBEDDING_API_KEY");
    cfg.embedding.endpoint = read_string("EMBEDDING_ENDPOINT");
    if let Some(d) = read_duration("EMBEDDING_TIMEOUT")? {
        cfg.embedding.timeout = d;
    }
    if let Some(model) = read_string("EMBEDDING_MODEL") {
        cfg.embedding.model_name = model;
    }
    if let Some(dim) = read_parsed::<usize>("EMBEDDING_DIMENSION")? {
        cfg.embedding.dimension = dim;
    }

    if let Some(enabled) = read_bool("CACHE_ENABLED")? {
        cfg.cache.enabled = enabled;
    }
    if let Some(size) = read_parsed::<usize>("CACHE_MAX_SIZE")? {
        cfg.cache.max_entries = size;
    }
    if let Some(d) = read_duration("CACHE_DEFAULT_TTL")? {
        cfg.cache.default_ttl = d;
    }
    if let Some(d) = read_duration("CACHE_CLEANUP_INTERVAL")? {
        cfg.cache.cleanup_interval = d;
    }

    if let Some(enabled) = read_bool("METRICS_ENABLED")? {
        cfg.monitoring.metrics_enabled = enabled;
    }
    if let Some(enabled) = read_bool("MONITORING_ENABLED")? {
        cfg.monitoring.monitoring_enabled = enabled;
    }
    if let Some(d) = read_duration("SLOW_QUERY_THRESHOLD")? {
        cfg.monitoring.slow_query_threshold = d;
    }
    if let Some(d) = read_duration("CONSISTENCY_CHECK_INTERVAL")? {
        cfg.monitoring.consistency_interval = d;
    }

    if let Some(width) = read_parsed::<usize>("INGEST_WORKER_WIDTH")? {
        cfg.ingest.worker_width = width.max(1);
    }
    if let Some(jobs) = read_parsed::<usize>("INGEST_MAX_JOBS")? {
        cfg.ingest.max_jobs = jobs.max(1);
    }

    if let Some(level) = read_string("LOG_LEVEL") {
        cfg.log.level = level;
    }
    match read_string("LOG_FORMAT").as_deref() {
        Some("json") | None => {}
        Some("pretty") | Some("text") => cfg.log.format = LogFormat::Pretty,
        Some(other) => {
            return Err(ConfigError::EnvParse {
                key: "LOG_FORMAT",
                message: format!("must be 'json' or 'pretty', got '{other}'"),
            });
        }
    }

    Ok(())
}

fn read_string(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_parsed<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match read_string(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::EnvParse {
            key,
            message: e.to_string(),
        }),
    }
}

fn read_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match read_string(key) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            other => Err(ConfigError::EnvParse {
                key,
                message: format!("must be a boolean, got '{other}'"),
            }),
        },
    }
}

fn read_duration(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match read_string(key) {
        None => Ok(None),
        Some(raw) => parse_duration(&raw).map(Some).map_err(|message| {
            ConfigError::EnvParse { key, message }
        }),
    }
}

/// Parses `500ms`, `30s`, `5m`, `1h`, or a bare integer (seconds).
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit): (&str, &str) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => (&raw[..split], raw[split..].trim()),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{raw}' is not a duration"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "sec" | "" => Ok(Duration::from_secs(value)),
        "m" | "min" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit '{other}' in '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10y").is_err());
    }

    #[test]
    fn builder_without_env_yields_defaults() {
        let cfg = ConfigBuilder::new().build().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.storage.kind, StorageKind::Memory);
    }

    #[test]
    fn builder_rejects_rest_base_without_credentials() {
        let mut base = ServerConfig::default();
        base.storage.kind = StorageKind::Rest;
        let err = ConfigBuilder::new().with_base(base).build().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { key: "STORAGE_URL" }));
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.cache.max_entries, 1000);
        assert_eq!(cfg.cache.default_ttl, Duration::from_secs(1800));
        assert_eq!(cfg.monitoring.slow_query_threshold, Duration::from_millis(500));
        assert_eq!(cfg.ingest.worker_width, 4);
        assert_eq!(cfg.ingest.max_jobs, 8);
        assert_eq!(cfg.embedding.dimension, 1536);
    }
}
