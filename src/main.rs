//! Storefront Bundles - flexible bundle service for a headless storefront

use anyhow::Result;
use std::sync::Arc;
use storefront_bundles::api::{self, AppState};
use storefront_bundles::config::Config;
use storefront_bundles::domain::events::EventBus;
use storefront_bundles::notify::forward_invalidations;
use storefront_bundles::services::{CartService, CatalogService, CommerceHttpClient, MemoryCommerce, PromoService};
use storefront_bundles::{CartSyncEngine, PromoStacker};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Backends = (Arc<dyn CartService>, Arc<dyn CatalogService>, Arc<dyn PromoService>);

fn backends<B: CartService + CatalogService + PromoService + 'static>(backend: Arc<B>) -> Backends {
    let carts: Arc<dyn CartService> = backend.clone();
    let catalog: Arc<dyn CatalogService> = backend.clone();
    let promos: Arc<dyn PromoService> = backend;
    (carts, catalog, promos)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = Config::from_env()?;

    let (carts, catalog, promos) = match config.http_settings() {
        Some(settings) => {
            tracing::info!(url = %settings.base_url, "Using commerce backend");
            backends(Arc::new(CommerceHttpClient::new(&settings)?))
        }
        None => {
            tracing::warn!("COMMERCE_BACKEND_URL not set, using in-memory backend");
            backends(Arc::new(MemoryCommerce::new()))
        }
    };

    let bus = EventBus::default();
    if let Some(url) = &config.nats_url {
        match async_nats::connect(url.as_str()).await {
            Ok(client) => { tokio::spawn(forward_invalidations(client, bus.subscribe(), config.cache_subject_prefix.clone())); }
            Err(e) => tracing::warn!(error = %e, "NATS unavailable, invalidations stay in process"),
        }
    }

    let state = AppState {
        engine: Arc::new(CartSyncEngine::new(carts.clone(), catalog.clone(), bus.clone(), config.sync_settings())),
        promos: Arc::new(PromoStacker::new(carts, promos, bus)),
        catalog,
    };
    let app = api::router(state);

    tracing::info!("🚀 Storefront bundles listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
