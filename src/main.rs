use std::sync::Arc;
use tracing::info;

use dhenu::config::Config;
use dhenu::gateway::gemini::GeminiClient;
use dhenu::gateway::vision::VisionGateway;
use dhenu::gateway::GenerationGateway;
use dhenu::server;
use dhenu::session::ChatController;
use dhenu::store::Store;
use dhenu::weather::{KeywordWeatherIntent, WeatherService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Dhenu advisory server starting...");

    let config = Config::from_env();
    if config.gemini_api_key.is_empty() {
        anyhow::bail!("GEMINI_API_KEY must be set");
    }

    info!("Initializing store at {}", config.db_path.display());
    let store = Store::new(&config.db_path).await?;
    store.init().await?;

    // Explicitly constructed, injected client handles; no process-wide
    // singletons.
    let gemini = Arc::new(GeminiClient::new(
        config.gemini_api_key.clone(),
        config.primary_model.clone(),
    ));
    let generation = GenerationGateway::new(
        gemini.clone(),
        vec![config.primary_model.clone(), config.fallback_model.clone()],
        config.request_timeout,
    );
    let vision = VisionGateway::new(gemini);
    let weather = Arc::new(WeatherService::new(
        Arc::new(KeywordWeatherIntent::new()),
        config.weather_api_key.clone(),
        config.default_location.clone(),
    ));

    let controller = ChatController::new(
        store.clone(),
        generation,
        vision,
        weather,
        config.stream_timeout,
    );

    let app = server::router(store, controller, &config);

    let listener =
        tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Listening on port {}", config.port);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
