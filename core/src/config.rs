use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use thiserror::Error;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    pub wal_flush_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_cookie_secure: bool,
    pub jwt_access_ttl_minutes: u32,
    pub metrics_require_auth: bool,
    /// Raw JSON; parsed by `core::auth` into key→scopes.
    pub api_keys_config: Option<String>,
    /// Raw JSON; parsed by `core::auth` into roles+assignments.
    pub rbac_config: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    pub max_top_k: usize,
    pub max_context_chars: usize,
    pub enable_rerank: bool,
    pub rerank_candidate_multiplier: usize,
    pub rerank_max_candidates: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InjectionFilterMode {
    Off,
    Downrank,
    Exclude,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InjectionFilterConfig {
    pub mode: InjectionFilterMode,
    pub risk_threshold: f32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub rps: f64,
    pub burst: u32,
    pub max_body_bytes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbPoolConfig {
    pub min_size: u32,
    pub max_size: u32,
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub ingestion: IngestionConfig,
    pub retrieval: RetrievalConfig,
    pub injection_filter: InjectionFilterConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub db_pool: DbPoolConfig,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub google_api_key: Option<String>,
    pub prompt_version: String,
    pub connector_encryption_key: Option<String>,
    pub fake_llm: bool,
    pub fake_embeddings: bool,
    pub run_mode: String,
}

#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("JWT_SECRET must be at least 32 characters in production")]
    WeakJwtSecret,
    #[error("CHUNK_OVERLAP ({overlap}) must be less than CHUNK_SIZE ({chunk_size})")]
    InvalidChunkOverlap { overlap: usize, chunk_size: usize },
    #[error("CHUNK_SIZE must be greater than 0")]
    InvalidChunkSize,
    #[error("RAG_INJECTION_RISK_THRESHOLD must be within [0, 1]")]
    InvalidRiskThreshold,
    #[error("PROMPT_VERSION must match v\\d+, got {0:?}")]
    InvalidPromptVersion(String),
    #[error("neither GOOGLE_API_KEY nor FAKE_LLM=1 + FAKE_EMBEDDINGS=1 is configured")]
    MissingModelCredentials,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("storage.data_dir", "./data")?
            .set_default("storage.wal_flush_interval_ms", 200)?
            .set_default("auth.jwt_secret", "")?
            .set_default("auth.jwt_cookie_secure", true)?
            .set_default("auth.jwt_access_ttl_minutes", 60)?
            .set_default("auth.metrics_require_auth", true)?
            .set_default("ingestion.chunk_size", 1000)?
            .set_default("ingestion.chunk_overlap", 100)?
            .set_default("ingestion.max_upload_bytes", 10 * 1024 * 1024)?
            .set_default("retrieval.max_top_k", 50)?
            .set_default("retrieval.max_context_chars", 12000)?
            .set_default("retrieval.enable_rerank", false)?
            .set_default("retrieval.rerank_candidate_multiplier", 5)?
            .set_default("retrieval.rerank_max_candidates", 200)?
            .set_default("injection_filter.mode", "downrank")?
            .set_default("injection_filter.risk_threshold", 0.6)?
            .set_default("rate_limit.rps", 10.0)?
            .set_default("rate_limit.burst", 20)?
            .set_default("rate_limit.max_body_bytes", 10 * 1024 * 1024)?
            .set_default("retry.max_attempts", 5)?
            .set_default("retry.base_delay_seconds", 0.5)?
            .set_default("retry.max_delay_seconds", 30.0)?
            .set_default("db_pool.min_size", 1)?
            .set_default("db_pool.max_size", 10)?
            .set_default("db_pool.statement_timeout_ms", 30_000)?
            .set_default("prompt_version", "v1")?
            .set_default("fake_llm", false)?
            .set_default("fake_embeddings", false)?
            .set_default("run_mode", run_mode.clone())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(Environment::with_prefix("ALAYASIKI").separator("__"))
            .add_source(Environment::default().try_parsing(true));

        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validates cross-field invariants named in spec.md §6/§9. Called once
    /// at process start, after `load()`.
    pub fn validate(&self, production: bool) -> Result<(), ConfigValidationError> {
        if production && self.auth.jwt_secret.len() < 32 {
            return Err(ConfigValidationError::WeakJwtSecret);
        }
        if self.ingestion.chunk_size == 0 {
            return Err(ConfigValidationError::InvalidChunkSize);
        }
        if self.ingestion.chunk_overlap >= self.ingestion.chunk_size {
            return Err(ConfigValidationError::InvalidChunkOverlap {
                overlap: self.ingestion.chunk_overlap,
                chunk_size: self.ingestion.chunk_size,
            });
        }
        if !(0.0..=1.0).contains(&self.injection_filter.risk_threshold) {
            return Err(ConfigValidationError::InvalidRiskThreshold);
        }
        if !is_prompt_version(&self.prompt_version) {
            return Err(ConfigValidationError::InvalidPromptVersion(
                self.prompt_version.clone(),
            ));
        }
        if self.google_api_key.is_none() && !(self.fake_llm && self.fake_embeddings) {
            return Err(ConfigValidationError::MissingModelCredentials);
        }
        Ok(())
    }
}

fn is_prompt_version(value: &str) -> bool {
    value
        .strip_prefix('v')
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            server: ServerConfig { host: "0.0.0.0".into(), port: 8080 },
            storage: StorageConfig { data_dir: "./data".into(), wal_flush_interval_ms: 200 },
            auth: AuthConfig {
                jwt_secret: "x".repeat(32),
                jwt_cookie_secure: true,
                jwt_access_ttl_minutes: 60,
                metrics_require_auth: true,
                api_keys_config: None,
                rbac_config: None,
            },
            ingestion: IngestionConfig { chunk_size: 1000, chunk_overlap: 100, max_upload_bytes: 1 << 20 },
            retrieval: RetrievalConfig {
                max_top_k: 50,
                max_context_chars: 12000,
                enable_rerank: false,
                rerank_candidate_multiplier: 5,
                rerank_max_candidates: 200,
            },
            injection_filter: InjectionFilterConfig { mode: InjectionFilterMode::Downrank, risk_threshold: 0.6 },
            rate_limit: RateLimitConfig { rps: 10.0, burst: 20, max_body_bytes: 1 << 20 },
            retry: RetryConfig { max_attempts: 5, base_delay_seconds: 0.5, max_delay_seconds: 30.0 },
            db_pool: DbPoolConfig { min_size: 1, max_size: 10, statement_timeout_ms: 30_000 },
            database_url: None,
            redis_url: None,
            google_api_key: None,
            prompt_version: "v1".into(),
            connector_encryption_key: None,
            fake_llm: true,
            fake_embeddings: true,
            run_mode: "test".into(),
        }
    }

    #[test]
    fn validates_good_config() {
        assert!(base_config().validate(true).is_ok());
    }

    #[test]
    fn rejects_weak_jwt_secret_in_production() {
        let mut config = base_config();
        config.auth.jwt_secret = "short".into();
        assert!(matches!(
            config.validate(true),
            Err(ConfigValidationError::WeakJwtSecret)
        ));
    }

    #[test]
    fn rejects_overlap_not_less_than_chunk_size() {
        let mut config = base_config();
        config.ingestion.chunk_overlap = 1000;
        assert!(matches!(
            config.validate(false),
            Err(ConfigValidationError::InvalidChunkOverlap { .. })
        ));
    }

    #[test]
    fn rejects_bad_prompt_version() {
        let mut config = base_config();
        config.prompt_version = "version-1".into();
        assert!(matches!(
            config.validate(false),
            Err(ConfigValidationError::InvalidPromptVersion(_))
        ));
    }

    #[test]
    fn requires_model_credentials_without_fakes() {
        let mut config = base_config();
        config.fake_llm = false;
        config.fake_embeddings = false;
        config.google_api_key = None;
        assert!(matches!(
            config.validate(false),
            Err(ConfigValidationError::MissingModelCredentials)
        ));
    }
}
