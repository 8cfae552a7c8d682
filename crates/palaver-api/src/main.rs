use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use palaver_api::{
    app::build_router,
    config::{Config, StorageBackend},
    state::AppState,
};
use palaver_llm::ClientFactory;
use palaver_persist::{InMemoryStore, ThreadStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    init_logging(&config);

    tracing::info!("Starting Palaver API server");
    tracing::info!("Config loaded: {}:{}", config.server.host, config.server.port);

    let llm_client = ClientFactory::create_client(
        config.llm.provider_config(config.openai_api_key.clone()),
    )?;
    if config.openai_api_key.is_none() {
        tracing::warn!("No server-side provider key; requests must send x-provider-api-key");
    }

    let store = connect_store(&config).await?;

    let state = Arc::new(AppState::new(config.clone(), store, llm_client));
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Health check: http://{}/health", addr);
    tracing::info!("API docs: http://{}/api/docs", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn ThreadStore>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory thread store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        #[cfg(feature = "mongodb")]
        StorageBackend::Mongodb => {
            let uri = config
                .mongodb_uri
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("MONGODB_URI is not set"))?;
            tracing::info!(database = %config.storage.database, "Connecting to MongoDB");
            let store = palaver_persist::MongoStore::connect(uri, &config.storage.database).await?;
            tracing::info!("MongoDB connected");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "mongodb"))]
        StorageBackend::Mongodb => Err(anyhow::anyhow!(
            "storage.backend = \"mongodb\" requires building with the `mongodb` feature"
        )),
    }
}

fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}
