//! Rookery - regional bird catalog and identification service

use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rookery::{
    catalog::CatalogSync,
    config::Args,
    db::{Datastore, MemoryStore, MongoStore},
    events,
    facts::FactService,
    identify::IdentifyService,
    lifecycle::LifecycleService,
    remote::{
        images::{HttpImageSearch, ImageSearch},
        HttpContentGenerator, HttpObservationProvider,
    },
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("rookery={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Rookery - regional bird service");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Region: {}", args.region);
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );

    // Datastore: MongoDB in production, in-memory fallback in dev mode
    let (store, datastore_connected): (Arc<dyn Datastore>, bool) =
        match MongoStore::connect(&args.mongodb_uri, &args.mongodb_db).await {
            Ok(mongo) => {
                info!("Connected to MongoDB database '{}'", args.mongodb_db);
                (Arc::new(mongo), true)
            }
            Err(e) if args.dev_mode => {
                warn!("MongoDB unavailable ({}), using in-memory datastore", e);
                (Arc::new(MemoryStore::new()), false)
            }
            Err(e) => {
                error!("Failed to connect to MongoDB: {}", e);
                std::process::exit(1);
            }
        };

    let observation_key = args.observation_api_key.clone().unwrap_or_default();
    let generator_key = args.generator_api_key.clone().unwrap_or_default();

    let provider = Arc::new(HttpObservationProvider::new(
        &args.observation_api_url,
        &observation_key,
        args.observations_timeout(),
    )?);
    let fact_generator = Arc::new(HttpContentGenerator::new(
        &args.generator_api_url,
        &generator_key,
        &args.generator_model,
        args.facts_timeout(),
    )?);
    let vision_generator = Arc::new(HttpContentGenerator::new(
        &args.generator_api_url,
        &generator_key,
        &args.generator_model,
        args.identify_timeout(),
    )?);
    let images: Option<Arc<dyn ImageSearch>> = match &args.image_api_key {
        Some(key) => Some(Arc::new(HttpImageSearch::new(
            &args.image_api_url,
            key,
            args.images_timeout(),
        )?)),
        None => {
            warn!("IMAGE_API_KEY not set, image search disabled");
            None
        }
    };

    let (bus, _dispatcher) = events::spawn_dispatcher(Arc::clone(&store));

    let catalog = Arc::new(CatalogSync::new(
        Arc::clone(&store),
        provider,
        args.retry_policy(args.observations_timeout()),
    ));
    let facts = Arc::new(FactService::new(
        Arc::clone(&store),
        fact_generator,
        args.retry_policy(args.facts_timeout()),
    ));
    let identify = Arc::new(IdentifyService::new(
        Arc::clone(&store),
        vision_generator,
        args.retry_policy(args.identify_timeout()),
    ));
    let lifecycle = Arc::new(LifecycleService::new(Arc::clone(&store), bus.clone()));

    let state = Arc::new(AppState {
        args,
        store,
        catalog,
        facts,
        identify,
        lifecycle,
        images,
        events: bus,
        datastore_connected,
        started_at: Instant::now(),
    });

    server::run(state).await?;
    Ok(())
}
