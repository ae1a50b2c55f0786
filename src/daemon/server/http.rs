use crate::daemon::assembler::QueryFailure;
use crate::daemon::engine::{Engine, EngineStatus};
use crate::daemon::registry::{SubscriberId, WatchSubscriber};
use crate::daemon::snapshot::Row;
use crate::storage::StoreError;
use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use log::{debug, info, warn};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::WatchStream;

pub const UPDATE_EVENT: &str = "dashboard:update";
pub const SUBSCRIBED_EVENT: &str = "subscribed";

#[derive(Debug, Serialize)]
struct QueryRows {
    name: String,
    rows: Vec<Row>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Subscribed {
    subscriber_id: SubscriberId,
}

/// Disconnects its subscriber when the SSE stream is dropped.
struct SubscriptionGuard {
    engine: Engine,
    id: SubscriberId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        debug!("SSE stream for {} closed", self.id);
        self.engine.disconnect(self.id);
    }
}

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/v1/snapshot", get(snapshot_handler))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream_handler))
        .route("/v1/queries/{name}", get(query_handler))
        .route("/v1/notify", post(notify_handler))
        .route("/v1/subscribers/{id}/refresh", post(refresh_handler))
        .with_state(engine)
}

async fn snapshot_handler(State(engine): State<Engine>) -> Response {
    match engine.snapshot() {
        Some(snap) => Json(snap.as_ref().clone()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn status_handler(State(engine): State<Engine>) -> Json<EngineStatus> {
    Json(engine.status())
}

async fn notify_handler(State(engine): State<Engine>) -> StatusCode {
    engine.notify_changed();
    StatusCode::ACCEPTED
}

async fn refresh_handler(State(engine): State<Engine>, Path(id): Path<u64>) -> StatusCode {
    match engine.request_refresh(SubscriberId(id)) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            debug!("Refresh request rejected: {}", e);
            StatusCode::NOT_FOUND
        }
    }
}

async fn query_handler(State(engine): State<Engine>, Path(name): Path<String>) -> Response {
    match engine.query(&name).await {
        Ok(rows) => Json(QueryRows { name, rows }).into_response(),
        Err(e) => {
            let status = match &e.cause {
                QueryFailure::Store(StoreError::UnknownQuery(_)) => StatusCode::NOT_FOUND,
                QueryFailure::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
                QueryFailure::Store(StoreError::Query(_)) => StatusCode::INTERNAL_SERVER_ERROR,
                QueryFailure::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            };
            (status, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

async fn stream_handler(
    State(engine): State<Engine>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let (sink, rx) = WatchSubscriber::channel();
    let id = match engine.connect(Arc::new(sink)) {
        Ok(id) => id,
        Err(e) => {
            debug!("Refusing stream: {}", e);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    };
    let guard = SubscriptionGuard { engine, id };

    let hello = Event::default()
        .event(SUBSCRIBED_EVENT)
        .json_data(Subscribed { subscriber_id: id })
        .unwrap_or_else(|_| Event::default().event(SUBSCRIBED_EVENT));
    let updates = WatchStream::new(rx).filter_map(move |snap| {
        let _keep = &guard;
        let event = snap.map(|snap| {
            let data = serde_json::to_string(&*snap).unwrap_or_else(|_| "{}".into());
            Ok(Event::default().event(UPDATE_EVENT).data(data))
        });
        futures_util::future::ready(event)
    });
    Ok(
        Sse::new(stream::once(futures_util::future::ready(Ok(hello))).chain(updates))
            .keep_alive(KeepAlive::default()),
    )
}

/// Accepts connections until `shutdown` resolves. Each connection is served on
/// its own task.
pub async fn serve<F>(listener: TcpListener, engine: Engine, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let addr = listener.local_addr().context("read listener address")?;
    info!("HTTP server listening on {}", addr);
    let app = router(engine);
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };
        let io = TokioIo::new(stream);
        let service = TowerToHyperService::new(app.clone());

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                // Subscribers closing their stream mid-response is a normal exit.
                if err.is_incomplete_message() {
                    debug!("Client {} disconnected while streaming", peer);
                } else {
                    warn!("Error serving connection from {}: {:?}", peer, err);
                }
            }
        });
    }

    info!("HTTP server on {} stopped accepting connections", addr);
    Ok(())
}
