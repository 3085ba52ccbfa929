use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub safety: SafetyConfig,
    pub executor: ExecutorConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub datasets: DatasetConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    /// Deadline for one collaborator call; exceeding it is an ordinary
    /// stage failure, never a hang.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    pub max_sql_len: usize,
    pub allow_explain: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub statement_timeout_secs: u64,
    pub max_joins: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

/// Scope of the single-repair bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairPolicy {
    /// One repair attempt per distinct failing stage-occurrence in a run.
    PerStage,
    /// One repair attempt for the whole run.
    PerRun,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub repair_policy: RepairPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    /// Directory holding SQLite dataset files registered at startup.
    pub data_dir: String,
    /// Dataset used when a request names none.
    pub default_dataset: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("llm.gateway_url", "http://localhost:8080")?
            .set_default("llm.timeout_secs", 30)?
            .set_default("safety.max_sql_len", 8192)?
            .set_default("safety.allow_explain", false)?
            .set_default("executor.statement_timeout_secs", 10)?
            .set_default("executor.max_joins", 4)?
            .set_default("cache.capacity", 1000)?
            .set_default("cache.ttl_secs", 300)?
            .set_default("pipeline.repair_policy", "per_stage")?
            .set_default("datasets.data_dir", "./data")?
            .set_default("datasets.default_dataset", "demo")?
            .set_default("logging.level", "info")?;

        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port.parse::<u16>().unwrap_or(3000))?;
        }
        if let Ok(gateway_url) = env::var("LLM_GATEWAY_URL") {
            builder = builder.set_override("llm.gateway_url", gateway_url)?;
        }
        if let Ok(api_key) = env::var("LLM_API_KEY") {
            builder = builder.set_override("llm.api_key", Some(api_key))?;
        }
        if let Ok(timeout) = env::var("LLM_TIMEOUT_SECS") {
            builder = builder.set_override("llm.timeout_secs", timeout.parse::<u64>().unwrap_or(30))?;
        }
        if let Ok(policy) = env::var("REPAIR_POLICY") {
            builder = builder.set_override("pipeline.repair_policy", policy)?;
        }
        if let Ok(data_dir) = env::var("DATA_DIR") {
            builder = builder.set_override("datasets.data_dir", data_dir)?;
        }
        if let Ok(default_dataset) = env::var("DEFAULT_DATASET") {
            builder = builder.set_override("datasets.default_dataset", default_dataset)?;
        }
        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        env::remove_var("HOST");
        env::remove_var("PORT");
        env::remove_var("REPAIR_POLICY");

        let config = Config::from_env().unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.pipeline.repair_policy, RepairPolicy::PerStage);
        assert!(!config.safety.allow_explain);
    }

    #[test]
    fn test_repair_policy_deserializes_snake_case() {
        let policy: RepairPolicy = serde_json::from_str("\"per_run\"").unwrap();
        assert_eq!(policy, RepairPolicy::PerRun);
    }
}
