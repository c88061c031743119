use livemap::config::RelayConfig;
use livemap::{db, routes, state};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = RelayConfig::from_env();

    // Postgres is optional for the relay; when configured, migrations run here.
    let pool = match &config.database_url {
        Some(url) => match db::init_pool(url).await {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::error!(error = %e, "database init failed");
                std::process::exit(1);
            }
        },
        None => {
            tracing::info!("DATABASE_URL not set; relay running without database");
            None
        }
    };

    let state = state::AppState::new(&config, pool);
    let app = routes::app(state);

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(port = config.port, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!(port = config.port, topic = %config.default_topic, "livemap relay listening");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
