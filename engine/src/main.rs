use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use magpie_core::{
    CancellationRegistry, EngineConfig, EventBus, ResearchJobHandler, Services,
};
use magpie_extract::{Extractor, SearxClient};
use magpie_providers::{provider_for_model, OpenAiCompatProvider};
use magpie_queue::{
    Broker, JobQueue, MemoryBroker, RedisBroker, WorkerPool, WorkerSettings,
};
use magpie_server::{serve, AppState};
use magpie_store::Store;
use magpie_types::RESEARCH_QUEUE;

#[derive(Parser, Debug)]
#[command(name = "magpie-engine")]
#[command(about = "AI-assisted research orchestration service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/WebSocket API together with the research worker pool.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, env = "PORT")]
        port: Option<u16>,
        /// Serve the API without claiming research jobs.
        #[arg(long, default_value_t = false)]
        no_workers: bool,
    },
    /// Print the resolved configuration and exit.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            no_workers,
        } => {
            let port = port.unwrap_or(config.port);
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;

            let (services, queue) = build_runtime(config).await?;
            let pool = if no_workers {
                None
            } else {
                let handler = Arc::new(ResearchJobHandler::new(services.clone()));
                let settings = WorkerSettings {
                    concurrency: services.config.worker_concurrency,
                    ..WorkerSettings::default()
                };
                info!(workers = settings.concurrency, "starting research worker pool");
                Some(WorkerPool::start(queue.clone(), handler, settings))
            };

            info!("starting magpie-engine on http://{addr}");
            let result = serve(addr, AppState::new(services, queue)).await;
            if let Some(pool) = pool {
                pool.shutdown().await;
            }
            result?;
        }
        Command::Config => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "port": config.port,
                    "database_url": config.database_url,
                    "redis": config.redis_url.is_some(),
                    "searx_endpoint": config.searx_endpoint,
                    "llm_base_url": config.llm_base_url,
                    "llm_default_model": config.llm_default_model,
                    "llm_provider": provider_for_model(&config.llm_default_model),
                    "max_sources_ceiling": config.max_sources_ceiling,
                    "worker_concurrency": config.worker_concurrency,
                    "env": config.env,
                }))?
            );
        }
    }

    Ok(())
}

async fn build_runtime(config: EngineConfig) -> anyhow::Result<(Services, JobQueue)> {
    let store = Arc::new(
        Store::open(Path::new(&config.database_url))
            .await
            .with_context(|| format!("opening database at {}", config.database_url))?,
    );

    let provider = Arc::new(OpenAiCompatProvider::new(
        &config.llm_base_url,
        config.llm_api_key.clone(),
        config.llm_default_model.clone(),
    ));
    info!(
        model = %config.llm_default_model,
        provider = provider_for_model(&config.llm_default_model),
        "llm client configured"
    );

    let broker: Arc<dyn Broker> = match config.redis_url.as_deref() {
        Some(url) => {
            let broker = RedisBroker::connect(url)
                .await
                .with_context(|| format!("connecting to redis at {url}"))?;
            info!("job queue backed by redis");
            Arc::new(broker)
        }
        None => {
            tracing::warn!(
                "REDIS_URL not set; using the in-memory broker (single-process mode, \
                 queued jobs do not survive restarts)"
            );
            Arc::new(MemoryBroker::new())
        }
    };
    let queue = JobQueue::new(broker, RESEARCH_QUEUE);

    let services = Services {
        search: Arc::new(SearxClient::new(&config.searx_endpoint)),
        extractor: Arc::new(Extractor::new()),
        provider,
        store,
        bus: EventBus::new(),
        cancellations: CancellationRegistry::new(),
        config,
    };
    Ok((services, queue))
}
