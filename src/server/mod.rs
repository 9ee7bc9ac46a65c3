pub mod error;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use bytes::Bytes;
use hyper::StatusCode;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::App;
use crate::config::ServerConfig;
use crate::shutdown::Shutdown;
use crate::webhook;
use error::Error;

mod custom_middleware;
pub mod data;

use data::{
    PoolStatsResponse, ReleaseRequest, ReleaseResponse, ReserveRequest, ReserveResponse, ResetUnpaidRequest,
    UpdateMaxGapRequest, UpdateThresholdsRequest, WebhookResponse,
};

const DEFAULT_SITE: &str = "default";
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

async fn reserve(
    State(app): State<Arc<App>>,
    Json(req): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<ReserveResponse>), Error> {
    let address = app.reserve(&req.site, &req.customer, req.amount, req.fast).await?;
    Ok((StatusCode::OK, Json(ReserveResponse { address })))
}

async fn webhook_default(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    handle_webhook(app, DEFAULT_SITE.to_owned(), headers, body).await
}

async fn webhook_for_site(
    State(app): State<Arc<App>>,
    Path(site): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    handle_webhook(app, site, headers, body).await
}

/// Verifies the signature header, parses the payload, and dispatches to the
/// core's `webhook::handle`. Always responds `200/400/401` per
/// `SPEC_FULL.md` §6; it never returns a server error for a malformed or
/// unauthenticated inbound call.
async fn handle_webhook(
    app: Arc<App>,
    site: String,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    let signature = headers.get("X-Webhook-Signature").and_then(|v| v.to_str().ok());
    match signature {
        Some(sig) if webhook::verify_signature(&app.config.webhook.secret, &body, sig).is_ok() => {}
        _ => return (StatusCode::UNAUTHORIZED, Json(WebhookResponse { outcome: "bad_signature" })),
    }

    let payload = match webhook::parse_payload(&body) {
        Ok(payload) => payload,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(WebhookResponse { outcome: "malformed" })),
    };

    let ctx = match app.webhook_context(&site).await {
        Ok(ctx) => ctx,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(WebhookResponse { outcome: "unknown_site" })),
    };

    let cancel = app.cancel_handle_for(&payload.addr).await;
    let outcome = webhook::handle(&ctx, &payload, cancel.as_ref()).await;

    let label = match outcome {
        webhook::Outcome::Unconfirmed => "unconfirmed",
        webhook::Outcome::Untracked => "untracked",
        webhook::Outcome::Confirmed => "confirmed",
        webhook::Outcome::AlreadyConfirmed => "already_confirmed",
    };

    (StatusCode::OK, Json(WebhookResponse { outcome: label }))
}

async fn ws_balance(
    State(app): State<Arc<App>>,
    Path(address): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_balance_socket(app, address, socket))
}

async fn run_balance_socket(app: Arc<App>, address: String, mut socket: WebSocket) {
    let mut subscription = app.fanout.subscribe_duplex(&address).await;
    let mut ping_ticker = tokio::time::interval(WS_PING_INTERVAL);
    ping_ticker.tick().await;

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                let Some(event) = event else { break };
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            _ = ping_ticker.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                if !matches!(incoming, Some(Ok(_))) {
                    break;
                }
            }
        }
    }

    app.fanout.unsubscribe(&address, subscription.id).await;
}

async fn events_balance(
    State(app): State<Arc<App>>,
    Path(address): Path<String>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut subscription = app.fanout.subscribe_events(&address).await;
    let stream = async_stream::stream! {
        while let Some(event) = subscription.receiver.recv().await {
            yield Ok(Event::default().json_data(event).unwrap_or_else(|_| Event::default().data("")));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics() -> Result<Response, Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| anyhow::anyhow!(e))?;

    Ok(([(hyper::header::CONTENT_TYPE, encoder.format_type().to_owned())], buffer).into_response())
}

async fn admin_release(
    State(app): State<Arc<App>>,
    Path(site): Path<String>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>, Error> {
    let pool = app.pool_registry.pool(&site).await.map_err(crate::app::error::Error::from)?;
    let released = pool.release(&req.address).await;
    Ok(Json(ReleaseResponse { released }))
}

async fn admin_force_refill(State(app): State<Arc<App>>, Path(site): Path<String>) -> Result<StatusCode, Error> {
    let pool = app.pool_registry.pool(&site).await.map_err(crate::app::error::Error::from)?;
    pool.refill_if_needed().await;
    Ok(StatusCode::ACCEPTED)
}

async fn admin_pool_stats(
    State(app): State<Arc<App>>,
    Path(site): Path<String>,
) -> Result<Json<PoolStatsResponse>, Error> {
    let pool = app.pool_registry.pool(&site).await.map_err(crate::app::error::Error::from)?;
    let stats = pool.stats().await;
    Ok(Json(PoolStatsResponse {
        site,
        available: stats.available,
        reserved: stats.reserved,
        used: stats.used,
        total_generated: stats.total_generated,
        recycled: stats.recycled,
        gap_errors: stats.gap_errors,
        last_error: stats.last_error,
    }))
}

/// The gap-limit monitor is a single process-wide instance shared across
/// every site pool (see `app::App::new`), so this takes `:site` for wire
/// parity with the other admin routes but the reset applies globally.
async fn admin_reset_unpaid(
    State(app): State<Arc<App>>,
    Path(_site): Path<String>,
    body: Option<Json<ResetUnpaidRequest>>,
) -> StatusCode {
    let unpaid = body.map(|Json(req)| req.unpaid).unwrap_or_default();
    app.gap_limit.reset_unpaid(unpaid).await;
    StatusCode::NO_CONTENT
}

/// See the comment on `admin_reset_unpaid`: the gap-limit monitor is shared
/// process-wide, so `:site` is accepted for wire parity but ignored.
async fn admin_update_thresholds(
    State(app): State<Arc<App>>,
    Path(_site): Path<String>,
    Json(req): Json<UpdateThresholdsRequest>,
) -> StatusCode {
    app.gap_limit.update_thresholds(req.warn, req.critical);
    StatusCode::NO_CONTENT
}

async fn admin_update_max_gap(
    State(app): State<Arc<App>>,
    Path(_site): Path<String>,
    Json(req): Json<UpdateMaxGapRequest>,
) -> StatusCode {
    app.gap_limit.update_max_gap_limit(req.max_gap);
    StatusCode::NO_CONTENT
}

/// # Errors
///
/// Returns `Err` if the configured address cannot be bound.
pub async fn run(app: Arc<App>, config: ServerConfig, shutdown: Shutdown) -> anyhow::Result<()> {
    info!(address = %config.address, "binding server");
    let listener = TcpListener::bind(config.address).await?;
    serve(app, config, listener, shutdown).await
}

/// Builds the full route tree for `app`. Split out from `serve` so tests can
/// drive it with `axum_test::TestServer` without binding a socket.
fn router(app: Arc<App>, config: &ServerConfig) -> Router {
    let admin_routes = Router::new()
        .route("/admin/pool/:site/release", post(admin_release))
        .route("/admin/pool/:site/force-refill", post(admin_force_refill))
        .route("/admin/pool/:site/stats", get(admin_pool_stats))
        .route("/admin/gap-limit/:site/reset-unpaid", post(admin_reset_unpaid))
        .route("/admin/gap-limit/:site/thresholds", post(admin_update_thresholds))
        .route("/admin/gap-limit/:site/max-gap", post(admin_update_max_gap))
        .layer(middleware::from_fn_with_state(app.clone(), custom_middleware::admin_auth_layer::middleware));

    Router::new()
        .route("/reserve", post(reserve))
        .route("/webhook/btc", post(webhook_default))
        .route("/webhook/btc/:site", post(webhook_for_site))
        .route("/ws/balance/:address", get(ws_balance))
        .route("/events/balance/:address", get(events_balance))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(config.request_timeout, custom_middleware::timeout_layer::middleware))
        .layer(middleware::from_fn(custom_middleware::api_metrics_layer::middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

/// # Errors
///
/// Returns `Err` if the server fails while accepting connections.
pub async fn serve(
    app: Arc<App>,
    config: ServerConfig,
    listener: TcpListener,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let router = router(app, &config);
    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown.await_shutdown());
    server.await?;
    Ok(())
}
