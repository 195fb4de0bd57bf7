use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::{info, warn};

use knowledge_server::config::Settings;
use knowledge_server::database::{DbPool, Repository};
use knowledge_server::document::doc_type::DocTypeRegistry;
use knowledge_server::document::link_graph::LinkGraph;
use knowledge_server::graph::{GraphStore, MemoryGraphStore};
use knowledge_server::handlers;
use knowledge_server::resilience::{Pipelines, RateLimiterRegistry};
use knowledge_server::services::rag_service::ChunkReader;
use knowledge_server::services::{
    DocumentIndexer, EmbeddingCache, EmbeddingService, EntityExtractor, EventBus,
    HttpEmbeddingProvider, HttpGenerationProvider, RagService, SessionService,
};
use knowledge_server::state::AppState;
use knowledge_server::sync::{FileWatcher, GitSyncRunner, SyncScheduler};
use knowledge_server::tenant::ActiveSession;
use knowledge_server::vector::{PgVectorStore, VectorStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,knowledge_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("Starting knowledge server");

    let settings = Arc::new(Settings::load()?);
    info!("Configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let db_pool = DbPool::new(&settings.database).await?;
    info!("Database connection established");
    let repository = Arc::new(Repository::new(db_pool.clone()));

    let pipelines = Pipelines::new(&settings.resilience, shutdown_rx.clone());

    let embedding_cache = Arc::new(EmbeddingCache::new(&settings.cache));
    let embedder = Arc::new(EmbeddingService::new(
        Arc::new(HttpEmbeddingProvider::new(&settings.embedding)),
        embedding_cache.clone(),
        pipelines.embedding.clone(),
        &settings.embedding,
    ));
    let generator = Arc::new(HttpGenerationProvider::new(&settings.generation));
    let extractor = Arc::new(EntityExtractor::new(
        generator.clone(),
        pipelines.embedding.clone(),
    ));

    let vector_store: Arc<dyn VectorStore> = Arc::new(PgVectorStore::new(db_pool.clone()));
    let graph: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    let link_graph = Arc::new(LinkGraph::new());

    let event_bus = Arc::new(EventBus::new());
    let dispatcher = event_bus.spawn_dispatcher(shutdown_rx.clone());

    let doc_types = Arc::new(DocTypeRegistry::new());
    let session = ActiveSession::new();
    let session_service = Arc::new(SessionService::new(
        repository.clone(),
        doc_types.clone(),
        session.clone(),
    ));
    match session_service.load_persisted_doc_types().await {
        Ok(loaded) if loaded > 0 => info!(loaded, "Loaded persisted doc types"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "Could not load persisted doc types"),
    }

    let indexer = Arc::new(DocumentIndexer::new(
        repository.clone(),
        vector_store.clone(),
        graph.clone(),
        doc_types.clone(),
        embedder.clone(),
        extractor.clone(),
        link_graph.clone(),
        event_bus.clone(),
        &settings.chunking,
    )?);

    let reader: Arc<dyn ChunkReader> = repository.clone();
    let rag = Arc::new(RagService::new(
        reader,
        embedder.clone(),
        generator.clone(),
        vector_store.clone(),
        graph.clone(),
        pipelines.storage.clone(),
        settings.rag.clone(),
    ));

    let rate_limiter = Arc::new(RateLimiterRegistry::new(settings.rate_limits.clone()));

    // Background sweepers for the embedding cache TTL and stale
    // rate-limit buckets.
    spawn_sweeper(
        "cache-ttl",
        Duration::from_secs(settings.cache.sweep_interval_seconds.max(1)),
        shutdown_rx.clone(),
        {
            let cache = embedding_cache.clone();
            move || {
                cache.sweep_expired();
            }
        },
    );
    spawn_sweeper(
        "rate-limit",
        Duration::from_secs(60),
        shutdown_rx.clone(),
        {
            let limiter = rate_limiter.clone();
            move || {
                limiter.sweep_stale();
            }
        },
    );

    let scheduler = if settings.sync.enabled && !settings.repositories.is_empty() {
        let runner = Arc::new(GitSyncRunner::new(
            settings.repositories.clone(),
            PathBuf::from(&settings.sync.workdir),
            indexer.clone(),
            graph.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            runner,
            Duration::from_secs(settings.sync.interval_seconds.max(1)),
        ));
        let _ = scheduler.clone().spawn(shutdown_rx.clone());
        info!("Git sync scheduler started");
        Some(scheduler)
    } else {
        None
    };

    let watcher = if settings.watcher.enabled {
        Some(Arc::new(FileWatcher::new(
            indexer.clone(),
            repository.clone(),
            &settings.watcher,
        )))
    } else {
        None
    };

    let state = AppState {
        settings: settings.clone(),
        repository,
        session,
        session_service,
        indexer,
        rag,
        event_bus: event_bus.clone(),
        embedding_cache,
        rate_limiter,
        scheduler,
        watcher,
        watcher_task: Arc::new(parking_lot::Mutex::new(None)),
        shutdown: shutdown_rx.clone(),
    };

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    event_bus.shutdown();
    let _ = dispatcher.await;
    info!("Knowledge server stopped");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check));

    let api_routes = Router::new()
        .route(
            "/api/activate",
            post(handlers::session::activate_project_handler),
        )
        .route(
            "/api/doc-types",
            get(handlers::doc_types::list_doc_types_handler)
                .post(handlers::doc_types::register_doc_type_handler),
        )
        .route(
            "/api/documents/index",
            post(handlers::documents::index_document_handler),
        )
        .route(
            "/api/documents/delete",
            post(handlers::documents::delete_documents_handler),
        )
        .route(
            "/api/documents/promotion",
            post(handlers::documents::update_promotion_handler),
        )
        .route("/api/search", post(handlers::search::search_handler))
        .route(
            "/api/external/search",
            post(handlers::search::search_external_handler),
        )
        .route("/api/query", post(handlers::query::rag_query_handler))
        .route(
            "/api/external/query",
            post(handlers::query::rag_query_external_handler),
        )
        .route("/api/status", get(handlers::health::get_status))
        .route("/api/metrics", get(handlers::health::get_metrics));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(Extension(state))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(CatchPanicLayer::new())
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
}

fn spawn_sweeper<F>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    sweep: F,
) where
    F: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => sweep(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(sweeper = name, "Sweeper stopped");
    });
}
