use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bumpbot_core::{
    ci::CiClient,
    config::Config,
    notify::LogNotifier,
    pipeline::Bot,
    registry::RunRegistry,
    run::HandlerContext,
    store::RunStore,
    webhook::PullRequestEvent,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub bot: Arc<Bot>,
}

// ── Error helper ──────────────────────────────────────────────────────────

fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bumpbot=info,bumpbot_server=info,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env();
    let projects = config.load_projects()?;
    info!(
        "Watching {} project(s): {}",
        projects.len(),
        projects.keys().cloned().collect::<Vec<_>>().join(", ")
    );

    std::fs::create_dir_all(&config.cache_dir)?;
    std::fs::create_dir_all(&config.sandbox_dir)?;

    let store = Arc::new(RunStore::open(&config.store_path)?);
    let config = Arc::new(config);

    let ctx = Arc::new(HandlerContext {
        config: Arc::clone(&config),
        store,
        registry: Arc::new(RunRegistry::default()),
        notifier: Arc::new(LogNotifier::default()),
    });
    let ci = Arc::new(CiClient::from_config(&config));
    let bot = Arc::new(Bot::new(ctx, projects, ci));

    // Scheduled dependency-update sweep
    if config.polling_interval_s > 0 {
        let bot = Arc::clone(&bot);
        let interval_s = config.polling_interval_s;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_s));
            loop {
                interval.tick().await;
                let mut names: Vec<String> = bot.projects.keys().cloned().collect();
                names.sort_unstable();
                for name in names {
                    let (triggered, reason) = bot.update_dependencies(&name).await;
                    info!("Dependency sweep for {name}: triggered={triggered} ({reason})");
                }
            }
        });
    }

    let state = Arc::new(AppState { bot });

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/:id", get(get_run))
        .route("/github_handler", post(github_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_runs(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let ctx = state.bot.context();
    let live: Vec<Value> = ctx
        .registry
        .live()
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "title": r.title,
                "start_time": r.start_time.to_rfc3339(),
            })
        })
        .collect();
    let recent: Vec<Value> = ctx
        .store
        .list_runs()
        .map_err(internal)?
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "title": r.title,
                "start_time": r.start_time.to_rfc3339(),
                "end_time": r.end_time.map(|t| t.to_rfc3339()),
                "failed": r.failed,
            })
        })
        .collect();
    Ok(Json(json!({ "live": live, "recent": recent })))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, StatusCode> {
    let ctx = state.bot.context();
    match ctx.store.get_run(id).map_err(internal)? {
        None => Err(StatusCode::NOT_FOUND),
        Some(run) => {
            let log = ctx.store.read_log(id).map_err(internal)?.unwrap_or_default();
            Ok(Json(json!({
                "id": run.id,
                "title": run.title,
                "start_time": run.start_time.to_rfc3339(),
                "end_time": run.end_time.map(|t| t.to_rfc3339()),
                "failed": run.failed,
                "live": ctx.registry.contains(run.id),
                "log": log,
            })))
        }
    }
}

/// GitHub webhook receiver. Acknowledges immediately; the version bump
/// runs in the background so webhook delivery never times out.
async fn github_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<PullRequestEvent>,
) -> StatusCode {
    let bot = Arc::clone(&state.bot);
    tokio::spawn(async move {
        if let Err(e) = bot.handle_pull_request_event(event).await {
            error!("pull request event failed: {e}");
        }
    });
    StatusCode::ACCEPTED
}
