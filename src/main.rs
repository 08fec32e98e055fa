use std::sync::Arc;

use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use worklog::completions::OpenAiCompletionClient;
use worklog::config::Config;
use worklog::db::PostgresConnection;
use worklog::registry::StreamRegistry;
use worklog::{web, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let db = PostgresConnection::new(&config.database_url)?;
    let completions = OpenAiCompletionClient::new(
        config.completions_api_base.clone(),
        config.completions_api_key.clone(),
    );

    let state = Arc::new(AppState {
        db: Arc::new(db),
        completions: Arc::new(completions),
        registry: StreamRegistry::new(),
        chat_model: config.chat_model.clone(),
        title_model: config.title_model.clone(),
        jwt_secret: config.jwt_secret.clone(),
        stream_ttl: config.stream_ttl,
    });

    let app = web::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("worklog server listening on {}", config.bind_address);
    axum::serve(listener, app).await?;

    Ok(())
}
