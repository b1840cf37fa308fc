use magpie_types::MAX_SOURCES_CEILING;

/// Process configuration, read once at startup from the environment. No
/// other component touches env vars.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    /// Path to the SQLite database file (a `sqlite://` prefix is accepted).
    pub database_url: String,
    /// Absent means single-process mode with the in-memory broker.
    pub redis_url: Option<String>,
    pub searx_endpoint: String,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_default_model: String,
    pub max_sources_ceiling: u32,
    pub worker_concurrency: usize,
    pub env: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "magpie.db".to_string(),
            redis_url: None,
            searx_endpoint: "http://127.0.0.1:8888".to_string(),
            llm_base_url: "http://127.0.0.1:4000".to_string(),
            llm_api_key: None,
            llm_default_model: "gpt-4o-mini".to_string(),
            max_sources_ceiling: MAX_SOURCES_CEILING,
            worker_concurrency: magpie_queue::WorkerSettings::default().concurrency,
            env: "development".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_var("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database_url: env_var("DATABASE_URL")
                .map(|v| v.trim_start_matches("sqlite://").to_string())
                .unwrap_or(defaults.database_url),
            redis_url: env_var("REDIS_URL"),
            searx_endpoint: env_var("SEARX_ENDPOINT").unwrap_or(defaults.searx_endpoint),
            llm_base_url: env_var("LITELLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_api_key: env_var("LITELLM_API_KEY"),
            llm_default_model: env_var("LITELLM_DEFAULT_MODEL")
                .unwrap_or(defaults.llm_default_model),
            max_sources_ceiling: env_var("MAX_SOURCES_PER_RESEARCH")
                .and_then(|v| v.parse().ok())
                .map(|v: u32| v.clamp(1, MAX_SOURCES_CEILING))
                .unwrap_or(defaults.max_sources_ceiling),
            worker_concurrency: env_var("WORKER_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.worker_concurrency),
            env: env_var("ENV")
                .or_else(|| env_var("NODE_ENV"))
                .unwrap_or(defaults.env),
        }
    }
}
