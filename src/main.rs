use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;

use conductor_core::chat::ChatModel;
use conductor_engine::{Dispatcher, MemoryManager, QueryAnalyzer, ResultConsolidator, Summarizer};
use conductor_llm::{ChatAgent, OpenAiCompatModel, ReliableChatModel};
use conductor_server::{AppConfig, Orchestrator, StreamManager};
use conductor_store::{CacheStore, Database, DurableStore, HybridStore, InProcessCache, MemoryStore};
use conductor_telemetry::init_telemetry;

#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Multi-agent session orchestration server")]
struct Cli {
    /// JSON config file. Missing sections keep their defaults.
    #[arg(long, short, env = "CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CONDUCTOR_PORT")]
    port: Option<u16>,

    /// SQLite file holding conversation history.
    #[arg(long, env = "CONDUCTOR_DB_PATH")]
    db_path: Option<PathBuf>,

    #[arg(long, env = "CONDUCTOR_LLM_BASE_URL")]
    llm_base_url: Option<String>,

    #[arg(long, env = "CONDUCTOR_LLM_MODEL")]
    llm_model: Option<String>,

    #[arg(long, env = "CONDUCTOR_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    #[arg(long, env = "CONDUCTOR_LOG_JSON")]
    log_json: Option<bool>,
}

impl Cli {
    fn apply(self, config: &mut AppConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = self.db_path {
            config.database.path = Some(path);
        }
        if let Some(url) = self.llm_base_url {
            config.llm.base_url = url;
        }
        if let Some(model) = self.llm_model {
            config.llm.model = model;
        }
        if let Some(key) = self.llm_api_key {
            config.llm.api_key = Some(SecretString::from(key));
        }
        if let Some(json) = self.log_json {
            config.telemetry.json = json;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path).context("load config")?,
        None => AppConfig::default(),
    };
    cli.apply(&mut config);

    let _telemetry = init_telemetry(config.telemetry.clone());
    tracing::info!("starting conductor");

    let db_path = config
        .database
        .path
        .clone()
        .unwrap_or_else(|| dirs_home().join(".conductor").join("conductor.db"));
    let db = Database::open(&db_path).context("open database")?;

    let cache_backend = match config.memory.cache_max_entries {
        Some(max) => InProcessCache::with_max_entries(max),
        None => InProcessCache::new(),
    };
    let cache: Arc<dyn MemoryStore> =
        Arc::new(CacheStore::new(Arc::new(cache_backend), config.cache_config()));
    let durable: Arc<dyn MemoryStore> = Arc::new(DurableStore::new(db));
    let store: Arc<dyn MemoryStore> = Arc::new(HybridStore::new(cache, durable));

    let client = OpenAiCompatModel::new(config.llm_config()).context("build chat client")?;
    let model: Arc<dyn ChatModel> = Arc::new(ReliableChatModel::new(client, config.reliable_config()));
    tracing::info!(model = %config.llm.model, base_url = %config.llm.base_url, "chat model configured");

    let mut memory = MemoryManager::new(store, config.memory_config());
    if let Some(summarizer) = config.summarizer_config() {
        memory = memory.with_summarizer(Arc::new(Summarizer::new(Arc::clone(&model), summarizer)));
    }

    let orchestrator = Arc::new(Orchestrator::new(
        QueryAnalyzer::new(Arc::clone(&model)).with_config(config.analyzer_config()),
        Dispatcher::new(
            Arc::new(ChatAgent::new(Arc::clone(&model))),
            Arc::clone(&model),
            config.dispatch_config(),
        ),
        ResultConsolidator::new(Arc::clone(&model)),
        memory,
        Arc::new(StreamManager::new(config.stream_config())),
    ));

    let handle = conductor_server::start(config.server.clone(), orchestrator)
        .await
        .context("start server")?;
    tracing::info!(port = handle.port, "conductor ready");

    tokio::signal::ctrl_c()
        .await
        .context("listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.stop().await;
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
