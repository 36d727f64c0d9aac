use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, routing::post, Router};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tollgate::{
    clock::TimeSource,
    config::{load_settings_from_file, EngineSettings},
    engine::GateEngine,
    metrics::Metrics,
    redis::{RedisConfig, RedisCounterStore},
    rules::{load_rules_from_file, RequestDescriptor, RuleSnapshot},
    store::{CounterStore, MemoryCounterStore},
    usage::LogUsageSink,
    GateDecision,
};

#[derive(Clone)]
struct AppState {
    engine: Arc<GateEngine>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tollgate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tollgate");

    let settings = match std::env::var("SETTINGS_PATH") {
        Ok(path) => load_settings_from_file(&path)?,
        Err(_) => EngineSettings::default(),
    };

    let metrics = Arc::new(Metrics::new()?);
    let clock = TimeSource::system();
    let store = create_store().await?;
    let engine = Arc::new(GateEngine::new(
        store.clone(),
        Arc::new(LogUsageSink),
        settings.clone(),
        clock.clone(),
        metrics.clone(),
    ));

    match std::env::var("RULES_PATH") {
        Ok(path) => load_and_install_rules(&engine, &metrics, &path)?,
        Err(_) => warn!("RULES_PATH not set, starting with an empty rule set"),
    }

    start_sweeper(store, clock, settings.counter_idle_seconds);

    let http_addr = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()?;

    let state = AppState {
        engine: engine.clone(),
        metrics,
    };
    let http_server = start_http_server(state, http_addr);

    info!("HTTP server listening on {}", http_addr);

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    engine.flush_usage().await;
    info!("Service stopped");
    Ok(())
}

async fn create_store() -> Result<Arc<dyn CounterStore>> {
    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let config = RedisConfig {
                url,
                ..Default::default()
            };
            let store = RedisCounterStore::connect(config).await?;
            info!("Using Redis counter store");
            Ok(Arc::new(store))
        }
        Err(_) => {
            info!("REDIS_URL not set, using in-memory counter store");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
    }
}

fn load_and_install_rules(engine: &GateEngine, metrics: &Metrics, path: &str) -> Result<()> {
    info!("Loading rules from: {}", path);
    match load_rules_from_file(path) {
        Ok(definitions) => {
            engine.install_snapshot(RuleSnapshot::compile(&definitions));
            Ok(())
        }
        Err(e) => {
            metrics.record_config_load_error();
            Err(e.into())
        }
    }
}

/// Periodically drop counters idle longer than the configured horizon.
fn start_sweeper(store: Arc<dyn CounterStore>, clock: TimeSource, idle_seconds: u64) {
    let idle_ms = idle_seconds as i64 * 1000;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            match store.sweep_idle(clock.now_ms(), idle_ms).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Swept idle counters"),
                Err(e) => warn!("Counter sweep failed: {}", e),
            }
        }
    });
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let app: Router = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/check", post(check_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn check_handler(
    State(state): State<AppState>,
    Json(descriptor): Json<RequestDescriptor>,
) -> Json<GateDecision> {
    Json(state.engine.check(&descriptor).await)
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.engine.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
