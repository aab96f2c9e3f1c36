//! OpenSASE Cart - Self-hosted shopping cart service

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opensase_cart::api::{self, AppState};
use opensase_cart::repository::postgres::{PgCartStore, PgDirectory};
use opensase_cart::{CartRepository, CheckoutBuilder, Config};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = Config::from_env()?;

    let db = PgPoolOptions::new().max_connections(config.max_connections).connect(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    let nats = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Some(client),
            Err(e) => { tracing::warn!(error = %e, "NATS unavailable, cart events will not be published"); None }
        },
        None => None,
    };

    let directory = Arc::new(PgDirectory::new(db.clone()));
    let carts = CartRepository::new(Arc::new(PgCartStore::new(db)), directory.clone(), directory.clone(), directory.clone());
    let state = AppState {
        carts,
        checkout: CheckoutBuilder::new(directory, config.image_base_url.clone()),
        nats,
        events_subject: config.events_subject.clone(),
    };

    let app = api::router(state);
    tracing::info!("🚀 OpenSASE Cart listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?, app).await?;
    Ok(())
}
