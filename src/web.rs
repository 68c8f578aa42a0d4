use crate::engine::{dispatch, Command, CommandResponse, Engine, EngineError};
use crate::records::Record;
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::{signal, sync::RwLock};

#[derive(Clone)]
struct SharedState {
    engine: Arc<RwLock<Engine>>,
}

async fn start_app(engine: Engine) {
    let addr = std::env::var("RECALL_ADDR")
        .unwrap_or_else(|_| engine.config().daemon_addr.clone());

    let engine = Arc::new(RwLock::new(engine));

    let signal = shutdown_signal(engine.clone());

    async fn shutdown_signal(engine: Arc<RwLock<Engine>>) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {
                log::warn!("waiting for the embedding worker to stop");
                engine.write().await.shutdown();
            },
            _ = terminate => {},
        }
    }

    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind daemon address");
    log::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .unwrap();
}

pub(crate) fn router(engine: Arc<RwLock<Engine>>) -> Router {
    let shared_state = Arc::new(SharedState { engine });

    Router::new()
        .route("/api/command", post(command))
        .route("/api/health", get(health))
        .route("/api/export", get(export))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

pub fn start_daemon(engine: Engine) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async { start_app(engine).await });
}

// Wraps `EngineError` so axum can turn it into a response.
#[derive(Debug)]
struct HttpError(EngineError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match self.0 {
            EngineError::NotFound
            | EngineError::SessionNotFound(_)
            | EngineError::RuleNotFound => (
                axum::http::StatusCode::NOT_FOUND,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            other => {
                log::error!("{other:?}");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": other.to_string()}).to_string(),
                )
            }
        }
        .into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<EngineError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn command(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<Command>,
) -> axum::Json<CommandResponse> {
    let engine = state.engine.clone();

    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let engine = engine.blocking_read();
        dispatch(&engine, payload).into()
    })
}

async fn health(
    State(state): State<Arc<SharedState>>,
) -> Result<axum::Json<serde_json::Value>, HttpError> {
    let engine = state.engine.clone();

    tokio::task::block_in_place(move || {
        let engine = engine.blocking_read();
        let stats = engine.stats()?;
        Ok(json!({
            "status": "ok",
            "records": stats.records,
            "vectors": stats.vectors,
        })
        .into())
    })
}

async fn export(
    State(state): State<Arc<SharedState>>,
) -> Result<axum::Json<Vec<Record>>, HttpError> {
    let engine = state.engine.clone();

    tokio::task::block_in_place(move || {
        let engine = engine.blocking_read();
        engine.export().map(Into::into).map_err(Into::into)
    })
}
