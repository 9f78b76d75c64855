use crate::registry::RegistryHandle;
use crate::resolver::QualityResolver;
use crate::status::StatusSink;
use crate::store::ChannelStore;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use skadi_proto::channel::{Channel, StreamQuality};
use skadi_proto::protocol::{
    ChannelsResponse, ErrorResponse, QualitiesResponse, SessionInfo, SessionsResponse,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpState {
    pub registry: RegistryHandle,
    pub store: Arc<ChannelStore>,
    pub resolver: QualityResolver,
    pub status: StatusSink,
}

#[derive(Debug, Deserialize)]
struct OpenParams {
    quality: Option<String>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/channels", get(list_channels))
        .route(
            "/api/channels/:name",
            post(add_channel).delete(remove_channel),
        )
        .route("/api/qualities/:name", get(get_qualities))
        .route("/api/open/:name", post(open_channel))
        .route("/api/close/:name", post(close_channel))
        .layer(cors())
        .layer(middleware::from_fn(reject_foreign_origin))
        .with_state(state)
}

/// Browser pages may only reach the API when they are served from this
/// machine.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin_allowed(origin)
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
}

/// Requests carrying a foreign `Origin` never reach a handler.
async fn reject_foreign_origin(request: Request, next: Next) -> Response {
    if let Some(origin) = request.headers().get(header::ORIGIN) {
        if !origin_allowed(origin) {
            warn!(
                "HTTP API: Refusing {} {} from origin {:?}",
                request.method(),
                request.uri().path(),
                origin
            );
            return error_response(StatusCode::FORBIDDEN, "origin not allowed");
        }
    }
    next.run(request).await
}

fn origin_allowed(origin: &HeaderValue) -> bool {
    origin.to_str().map(is_loopback_origin).unwrap_or(false)
}

/// `http(s)://localhost`, `127.0.0.1` or `[::1]`, optionally with a port.
fn is_loopback_origin(origin: &str) -> bool {
    let Some(authority) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    else {
        return false;
    };

    ["localhost", "127.0.0.1", "[::1]"].iter().any(|host| {
        authority.strip_prefix(host).is_some_and(|rest| {
            rest.is_empty()
                || rest
                    .strip_prefix(':')
                    .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
        })
    })
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn list_sessions(State(state): State<HttpState>) -> Response {
    match state.registry.sessions().await {
        Ok(channels) => Json(SessionsResponse {
            sessions: channels
                .into_iter()
                .map(|c| SessionInfo {
                    channel: c.name().to_string(),
                })
                .collect(),
        })
        .into_response(),
        Err(e) => {
            error!("Failed to list sessions: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn list_channels(State(state): State<HttpState>) -> Json<ChannelsResponse> {
    let channels = state.store.channels().await;
    Json(ChannelsResponse {
        channels: channels.iter().map(|c| c.name().to_string()).collect(),
    })
}

async fn add_channel(State(state): State<HttpState>, Path(name): Path<String>) -> StatusCode {
    info!("HTTP API: Track channel {}", name);
    if state.store.add(Channel::new(name)).await {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

async fn remove_channel(State(state): State<HttpState>, Path(name): Path<String>) -> StatusCode {
    info!("HTTP API: Untrack channel {}", name);
    if state.store.remove(&Channel::new(name)).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_qualities(State(state): State<HttpState>, Path(name): Path<String>) -> Response {
    let channel = Channel::new(name);
    info!("HTTP API: Resolve qualities for {}", channel);

    match state.resolver.resolve(&channel).await {
        Some(qualities) => Json(QualitiesResponse {
            channel: channel.name().to_string(),
            qualities,
        })
        .into_response(),
        None => {
            warn!("No stream qualities for {}", channel);
            state
                .status
                .update(format!("could not retrieve stream qualities for {}", channel));
            error_response(
                StatusCode::BAD_GATEWAY,
                format!("could not retrieve stream qualities for {}", channel),
            )
        }
    }
}

async fn open_channel(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    Query(params): Query<OpenParams>,
) -> Response {
    let quality = params
        .quality
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(StreamQuality::from_token)
        .unwrap_or_else(StreamQuality::best);
    info!("HTTP API: Open {} ({})", name, quality);

    match state.registry.open(Channel::new(name), quality).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!("Failed to send open command: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn close_channel(State(state): State<HttpState>, Path(name): Path<String>) -> Response {
    info!("HTTP API: Close {}", name);
    match state.registry.close(Channel::new(name)).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!("Failed to send close command: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
