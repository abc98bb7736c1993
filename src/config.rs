// config.rs — environment configuration surface (spec.md §6.4).

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct Config {
    pub scheduler_ai_enabled: bool,
    pub scheduler_ai_interval_ms: u64,
    pub scheduler_ai_auto_execute: bool,
    pub scheduler_reflection_enabled: bool,
    pub scheduler_reflection_interval_ms: u64,

    pub exchange_base_url: String,
    pub exchange_api_key: String,
    pub exchange_secret: String,
    pub exchange_passphrase: String,
    pub exchange_sandbox: bool,

    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads the environment surface spec.md §6.4 names. `.env` is loaded
    /// first (silently ignored if missing), matching the teacher's startup.
    pub fn from_env() -> Result<Self, CoreError> {
        dotenvy::dotenv().ok();

        let exchange_sandbox = env_bool("EX_SANDBOX", false);

        let exchange_base_url = std::env::var("EX_BASE_URL")
            .map_err(|_| CoreError::Config("EX_BASE_URL is required".to_string()))?;
        let exchange_api_key = std::env::var("EX_API_KEY")
            .map_err(|_| CoreError::Config("EX_API_KEY is required".to_string()))?;
        let exchange_secret = std::env::var("EX_SECRET")
            .map_err(|_| CoreError::Config("EX_SECRET is required".to_string()))?;
        let exchange_passphrase = std::env::var("EX_PASSPHRASE")
            .map_err(|_| CoreError::Config("EX_PASSPHRASE is required".to_string()))?;

        let llm_base_url = std::env::var("LLM_BASE_URL")
            .map_err(|_| CoreError::Config("LLM_BASE_URL is required".to_string()))?;
        let llm_api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| CoreError::Config("LLM_API_KEY is required".to_string()))?;
        let llm_model = std::env::var("LLM_MODEL")
            .map_err(|_| CoreError::Config("LLM_MODEL is required".to_string()))?;

        Ok(Self {
            scheduler_ai_enabled: env_bool("SCHED_AI_ENABLED", true),
            scheduler_ai_interval_ms: env_u64("SCHED_AI_INTERVAL_MS", 300_000),
            scheduler_ai_auto_execute: env_bool("SCHED_AI_AUTO_EXECUTE", false),
            scheduler_reflection_enabled: env_bool("SCHED_REFLECTION_ENABLED", true),
            scheduler_reflection_interval_ms: env_u64("SCHED_REFLECTION_INTERVAL_MS", 300_000),

            exchange_base_url,
            exchange_api_key,
            exchange_secret,
            exchange_passphrase,
            exchange_sandbox,

            llm_base_url,
            llm_api_key,
            llm_model,
        })
    }
}
