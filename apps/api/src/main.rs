mod cancel;
mod chat;
mod collaborators;
mod config;
mod db;
mod deployment;
mod embedding;
mod errors;
mod llm_client;
mod models;
mod portals;
mod retrieval;
mod retry;
mod routes;
mod state;
mod store;
#[cfg(test)]
mod testing;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::chat::{ChatDeps, ChatManager, RedisQuotaLedger};
use crate::collaborators::{PgDocumentSource, RedisAnalyticsSink, TierEntitlements};
use crate::config::Config;
use crate::db::create_pool;
use crate::deployment::{Deployer, DeployerDeps, S3PublishTarget};
use crate::embedding::{embedder_from_settings, EmbeddingPipeline};
use crate::llm_client::LlmClient;
use crate::portals::PortalService;
use crate::retrieval::postgres::PgVectorStore;
use crate::retrieval::RetrievalEngine;
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::postgres::PgRecordStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Portal API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;
    let records = Arc::new(PgRecordStore::new(db.clone()));
    let vectors = Arc::new(PgVectorStore::new(db.clone()));
    let documents = Arc::new(PgDocumentSource::new(db.clone()));
    let entitlements = Arc::new(TierEntitlements::new(db));

    // Initialize Redis
    let redis = redis::Client::open(config.redis_url.clone())?;
    let quota = Arc::new(RedisQuotaLedger::new(redis.clone()));
    let analytics = Arc::new(RedisAnalyticsSink::new(redis));
    info!("Redis client initialized");

    // Initialize S3 / MinIO
    let s3 = build_s3_client(&config).await;
    let publish = Arc::new(S3PublishTarget::new(
        s3,
        config.s3_bucket.clone(),
        config.s3_public_url.clone(),
    )?);
    info!("S3 publish target initialized (bucket: {})", config.s3_bucket);

    // Initialize embedding and LLM clients
    let embedder = embedder_from_settings(&config.embedding)?;
    info!(
        "Embedder initialized (model: {}, dims: {})",
        embedder.model_name(),
        embedder.dims()
    );
    let llm = Arc::new(LlmClient::new(config.anthropic_api_key.clone())?);
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    let chat = ChatManager::new(
        ChatDeps {
            records: records.clone(),
            retrieval: RetrievalEngine::new(vectors.clone(), &config.engine),
            embedder: embedder.clone(),
            completion: llm,
            quota,
            entitlements: entitlements.clone(),
            analytics: analytics.clone(),
        },
        config.engine.clone(),
    );
    chat.spawn_idle_sweeper(config.engine.session_idle_timeout);
    let deployer = Deployer::new(
        DeployerDeps {
            records: records.clone(),
            documents,
            entitlements: entitlements.clone(),
            pipeline: EmbeddingPipeline::new(embedder, &config.engine),
            vectors,
            publish,
            analytics: analytics.clone(),
        },
        config.engine.clone(),
    );
    let portals = PortalService::new(
        records,
        entitlements,
        analytics,
        chat.clone(),
        config.portal_public_base_url.clone(),
    );

    // Build app state
    let state = AppState {
        portals,
        deployer,
        chat,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins to the portal domain once it is fixed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "portal-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
