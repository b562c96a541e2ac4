use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::Extensions;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod classify;
mod files;
mod middleware;
mod mock;
mod stream;

use crate::browser::{self, Priority};
use crate::catalog::ModelCatalog;
use crate::config::GatewayConfig;
use crate::credential::Credential;
use crate::egress::{Dispatched, EgressPool, OutboundRequest, PathStatus};
use crate::error::{ApiError, ApiResult};
use crate::logging::ExchangeLog;
use crate::model_routing::RoutingDecision;
use crate::openai::{ChatRequest, ModelList, ModelObject, ResponsesRequest};
use crate::session::{SentMessage, SessionEndpoints, SessionHandshake};
use crate::transcode;

use self::files::FileRegistry;

/// Largest inbound body accepted on JSON endpoints.
const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

pub type SharedService = Arc<GatewayService>;

/// Shared state behind every handler.
pub struct GatewayService {
    pub config: Arc<GatewayConfig>,
    pub egress: Arc<EgressPool>,
    pub catalog: Arc<ModelCatalog>,
    pub credential: Arc<Credential>,
    session_endpoints: SessionEndpoints,
    files: FileRegistry,
}

/// An accepted upstream exchange whose body has not been read yet.
enum UpstreamStream {
    Direct(Dispatched),
    Session(SentMessage),
}

impl GatewayService {
    pub fn new(
        config: Arc<GatewayConfig>,
        egress: Arc<EgressPool>,
        catalog: Arc<ModelCatalog>,
        credential: Arc<Credential>,
    ) -> Self {
        let session_endpoints = SessionEndpoints::new(&config.session_base_url, &config.upstream_origin());
        Self {
            config,
            egress,
            catalog,
            credential,
            session_endpoints,
            files: FileRegistry::default(),
        }
    }

    /// Opens the upstream exchange for `chat` in the dialect `decision` picked.
    /// `raw` is the client's own body for the direct dialect; when absent the
    /// body is rebuilt from `chat`.
    async fn open_upstream(
        &self,
        decision: &RoutingDecision,
        chat: &ChatRequest,
        raw: Option<Value>,
        log: &ExchangeLog,
    ) -> ApiResult<UpstreamStream> {
        match decision {
            RoutingDecision::Session { persona_id, .. } => {
                let handshake =
                    SessionHandshake::new(&self.egress, &self.session_endpoints, self.credential.get());
                let created = handshake.create(*persona_id, &chat.model).await.map_err(|err| {
                    log.error(&format!("create session: {err}"));
                    ApiError::from(err)
                })?;
                info!("[{}] ℹ INF session={} persona_id={}", log.id, created.id(), persona_id);

                let message = transcode::flatten_for_session(&chat.messages);
                let sent = created.send(&message).await.map_err(|err| {
                    log.error(&format!("send message: {err}"));
                    ApiError::from(err)
                })?;
                log.upstream(200, &sent.path, "type=chatsession");
                Ok(UpstreamStream::Session(sent))
            }
            RoutingDecision::Direct {
                attach_credentials, ..
            } => {
                let body = match raw {
                    Some(raw) => transcode::direct_upstream_body(raw)?,
                    None => serde_json::to_vec(&transcode::chat_request_body(chat))
                        .map(Bytes::from)
                        .map_err(|e| ApiError::Internal(format!("Failed to create request: {e}")))?,
                };
                let url = transcode::upstream_endpoint(&self.config.upstream_url, decision.api_provider());
                let credential = attach_credentials.then(|| self.credential.get());
                let headers =
                    browser::upstream_headers(&self.config.upstream_origin(), Priority::Fixed, credential);

                let dispatched = self
                    .egress
                    .dispatch(OutboundRequest::post_json(url, headers, body))
                    .await
                    .map_err(|err| {
                        log.error(&format!("via={}: {}", err.path(), err));
                        ApiError::from(err)
                    })?;
                let status = dispatched.response.status();
                log.upstream(status.as_u16(), &dispatched.path, "");
                if status != reqwest::StatusCode::OK {
                    return Err(classify::upstream_error(dispatched.response, log).await);
                }
                Ok(UpstreamStream::Direct(dispatched))
            }
        }
    }

    /// Reads the upstream exchange to the end and folds it into one aggregate.
    async fn aggregate(
        &self,
        upstream: UpstreamStream,
        model: &str,
        log: &ExchangeLog,
    ) -> ApiResult<crate::translate::ChatAggregator> {
        let deadline = self.config.write_timeout;
        let agg = match upstream {
            UpstreamStream::Direct(d) => stream::aggregate_direct(d.response, log, deadline).await?,
            UpstreamStream::Session(sent) => stream::aggregate_session(sent, model, log, deadline).await?,
        };
        stream::log_aggregate(log, &agg);
        Ok(agg)
    }

    pub fn egress_status(&self) -> Vec<PathStatus> {
        self.egress.snapshot()
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|err| {
        warn!("invalid JSON body: {}", err);
        ApiError::invalid("Invalid JSON")
    })
}

async fn read_body(svc: &GatewayService, body: Body) -> ApiResult<Bytes> {
    match tokio::time::timeout(svc.config.read_timeout, to_bytes(body, MAX_REQUEST_BODY)).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(err)) => {
            warn!("read request body failed: {}", err);
            Err(ApiError::invalid("Failed to read request body"))
        }
        Err(_) => Err(ApiError::invalid("Failed to read request body")),
    }
}

fn client_addr(extensions: &Extensions) -> Option<SocketAddr> {
    extensions.get::<ConnectInfo<SocketAddr>>().map(|c| c.0)
}

async fn chat_completions(
    State(svc): State<SharedService>,
    extensions: Extensions,
    body: Body,
) -> ApiResult<Response> {
    let log = ExchangeLog::new("chat");
    let bytes = read_body(&svc, body).await?;
    let raw: Value = parse_json(&bytes)?;
    let chat: ChatRequest = serde_json::from_value(raw.clone()).map_err(|err| {
        warn!("[{}] invalid chat request: {}", log.id, err);
        ApiError::invalid("Invalid JSON")
    })?;
    transcode::validate_chat(&chat)?;

    let decision = svc.catalog.resolve(&chat.model).await;
    log.request(
        &chat.model,
        decision.label(),
        chat.messages.len(),
        chat.stream,
        client_addr(&extensions),
    );

    let upstream = svc.open_upstream(&decision, &chat, Some(raw), &log).await?;
    let deadline = svc.config.write_timeout;
    if chat.stream {
        return Ok(match upstream {
            UpstreamStream::Direct(d) => stream::forward_direct(d.response, log, deadline),
            UpstreamStream::Session(sent) => stream::forward_session(sent, &chat.model, log, deadline),
        });
    }

    let agg = svc.aggregate(upstream, &chat.model, &log).await?;
    Ok(Json(agg.into_completion(&chat.model)).into_response())
}

async fn responses(
    State(svc): State<SharedService>,
    extensions: Extensions,
    body: Body,
) -> ApiResult<Response> {
    let log = ExchangeLog::new("responses");
    let bytes = read_body(&svc, body).await?;
    let req: ResponsesRequest = parse_json(&bytes)?;
    let chat = transcode::responses_to_chat(&req)?;

    let decision = svc.catalog.resolve(&chat.model).await;
    log.request(
        &chat.model,
        decision.label(),
        chat.messages.len(),
        false,
        client_addr(&extensions),
    );

    let upstream = svc.open_upstream(&decision, &chat, None, &log).await?;
    let agg = svc.aggregate(upstream, &chat.model, &log).await?;
    Ok(Json(agg.into_responses(&chat.model, req.temperature, req.top_p, req.metadata)).into_response())
}

async fn list_models(State(svc): State<SharedService>) -> Json<ModelList> {
    let models = svc.catalog.list_models().await;
    info!("[Models] list returning {} models", models.len());
    Json(ModelList {
        object: "list",
        data: models.iter().map(|m| m.to_object()).collect(),
    })
}

async fn get_model(State(svc): State<SharedService>, Path(id): Path<String>) -> ApiResult<Json<ModelObject>> {
    match svc.catalog.get_model(&id).await {
        Some(entry) => Ok(Json(entry.to_object())),
        None => Err(ApiError::NotFound(format!("Model '{id}' not found"))),
    }
}

async fn health(State(svc): State<SharedService>) -> Json<Value> {
    Json(json!({"status": "ok", "egress": svc.egress_status()}))
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

/// Client-facing OpenAI routes under `prefix` ("" or "/v1").
fn api_routes(prefix: &str) -> Router<SharedService> {
    Router::new()
        .route(&format!("{prefix}/chat/completions"), post(chat_completions))
        .route(&format!("{prefix}/responses"), post(responses))
        .route(&format!("{prefix}/models"), get(list_models))
        .route(&format!("{prefix}/models/{{id}}"), get(get_model))
        .route(&format!("{prefix}/embeddings"), post(mock::embeddings))
        .route(&format!("{prefix}/moderations"), post(mock::moderations))
        .route(&format!("{prefix}/audio/speech"), post(mock::speech))
        .route(&format!("{prefix}/audio/transcriptions"), post(mock::transcriptions))
        .route(&format!("{prefix}/audio/translations"), post(mock::translations))
        .route(&format!("{prefix}/images/generations"), post(mock::image_generations))
        .route(&format!("{prefix}/images/edits"), post(mock::image_edits))
        .route(&format!("{prefix}/images/variations"), post(mock::image_variations))
        .route(&format!("{prefix}/files"), post(files::upload).get(files::list))
        .route(&format!("{prefix}/files/{{id}}"), get(files::get).delete(files::delete))
        .route(&format!("{prefix}/files/{{id}}/content"), get(files::content))
}

pub fn router(svc: SharedService) -> Router {
    Router::new()
        .merge(api_routes("/v1"))
        .merge(api_routes(""))
        .route("/health", get(health))
        .route("/", get(root))
        .layer(axum::middleware::from_fn_with_state(
            svc.clone(),
            middleware::require_api_key,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::cors())
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .with_state(svc)
}
