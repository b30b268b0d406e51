//! JSON HTTP surface for the outreach pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use clo_adapters::AnalysisError;
use clo_core::{NewTemplate, OwnerId, StaticIdentity, TransitionError};
use clo_pipeline::{
    pipeline_from_config, Compose, DispatchError, OutreachPipeline, PipelineConfig, PipelineError,
};
use clo_storage::StoreError;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clo-web";

/// Header carrying the authenticated owner, set by the gateway in front of this service.
pub const OWNER_HEADER: &str = "x-owner-id";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<OutreachPipeline>,
}

impl AppState {
    pub fn new(pipeline: OutreachPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/leads", get(list_leads_handler))
        .route("/leads/analyze", post(analyze_handler))
        .route("/leads/enrich", post(enrich_handler))
        .route("/leads/campaign", post(campaign_handler))
        .route("/leads/dispatch", post(dispatch_handler))
        .route("/leads/{id}", delete(delete_lead_handler))
        .route("/emails", get(list_emails_handler))
        .route("/templates", get(list_templates_handler).post(create_template_handler))
        .route("/templates/preview", post(preview_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    config.log_redacted();
    let pipeline = pipeline_from_config(&config).await?;
    serve(AppState::new(pipeline), config.web_port).await
}

fn identity(headers: &HeaderMap) -> StaticIdentity {
    StaticIdentity(
        headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<OwnerId>().ok()),
    )
}

/// Error response with a status code and a JSON `{"error": ..}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        } else {
            debug!(status = %self.status, error = %self.message, "request rejected");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::LeadNotFound(_)
        | StoreError::OwnerMismatch(_)
        | StoreError::Transition(TransitionError::Missing(_)) => StatusCode::NOT_FOUND,
        StoreError::InvalidCandidate { .. }
        | StoreError::InvalidTemplate(_)
        | StoreError::InvalidLogEntry(_)
        | StoreError::Transition(_) => StatusCode::BAD_REQUEST,
        StoreError::Corrupt(_) | StoreError::Database(_) | StoreError::Migrate(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            PipelineError::Analysis(AnalysisError::EmptyInput) => StatusCode::BAD_REQUEST,
            PipelineError::Analysis(AnalysisError::Normalize(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Analysis(AnalysisError::Completion(_)) => StatusCode::BAD_GATEWAY,
            PipelineError::Store(store) => store_status(store),
        };
        Self::new(status, err.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::Unauthenticated => StatusCode::UNAUTHORIZED,
            DispatchError::EmptyBatch | DispatchError::ForeignTarget(_) => StatusCode::BAD_REQUEST,
            DispatchError::Store(store) => store_status(store),
        };
        Self::new(status, err.to_string())
    }
}

type ApiResult = Result<Response, ApiError>;

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_leads_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let leads = state.pipeline.list_leads(&identity(&headers)).await?;
    Ok(Json(leads).into_response())
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    text: String,
}

async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult {
    let summary = state
        .pipeline
        .analyze_and_ingest(&identity(&headers), &req.text)
        .await?;
    Ok(Json(summary).into_response())
}

#[derive(Debug, Deserialize)]
struct IdsRequest {
    ids: Vec<Uuid>,
}

async fn enrich_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<IdsRequest>,
) -> ApiResult {
    let summary = state
        .pipeline
        .enrich_leads(&identity(&headers), &req.ids)
        .await?;
    Ok(Json(summary).into_response())
}

async fn campaign_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<IdsRequest>,
) -> ApiResult {
    let moved = state
        .pipeline
        .move_to_campaign(&identity(&headers), &req.ids)
        .await?;
    Ok(Json(moved).into_response())
}

async fn delete_lead_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult {
    state.pipeline.delete_lead(&identity(&headers), id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Default, Deserialize)]
struct DispatchRequest {
    #[serde(default)]
    ids: Vec<Uuid>,
    subject: Option<String>,
    body: Option<String>,
}

async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DispatchRequest>,
) -> ApiResult {
    let identity = identity(&headers);
    let targets = state.pipeline.select_targets(&identity, &req.ids).await?;
    let compose = Compose::new(req.subject, req.body);
    let result = state
        .pipeline
        .dispatch(&identity, &targets, &compose, &mut |processed: usize, total: usize| {
            debug!(processed, total, "dispatch progress");
        })
        .await?;
    Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
struct EmailsQuery {
    lead_id: Option<Uuid>,
}

async fn list_emails_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EmailsQuery>,
) -> ApiResult {
    let logs = state
        .pipeline
        .list_email_logs(&identity(&headers), query.lead_id)
        .await?;
    Ok(Json(logs).into_response())
}

async fn list_templates_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let templates = state.pipeline.list_templates(&identity(&headers)).await?;
    Ok(Json(templates).into_response())
}

async fn create_template_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<NewTemplate>,
) -> ApiResult {
    let template = state
        .pipeline
        .create_template(&identity(&headers), req)
        .await?;
    Ok((StatusCode::CREATED, Json(template)).into_response())
}

#[derive(Debug, Deserialize)]
struct PreviewRequest {
    subject: String,
    body: String,
    lead_id: Option<Uuid>,
}

async fn preview_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PreviewRequest>,
) -> ApiResult {
    let preview = state
        .pipeline
        .preview_template(&identity(&headers), &req.subject, &req.body, req.lead_id)
        .await?;
    Ok(Json(preview).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use clo_adapters::{
        CompletionClient, CompletionError, CompletionRequest, MailError, Mailer, OutboundEmail,
    };
    use clo_storage::MemoryLeadStore;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct FixedCompletion(&'static str);

    #[async_trait]
    impl CompletionClient for FixedCompletion {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
            Ok(self.0.to_string())
        }
    }

    struct UnreachableGateway;

    #[async_trait]
    impl CompletionClient for UnreachableGateway {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
            Err(CompletionError::Status {
                status: 503,
                body: "upstream unavailable".into(),
            })
        }
    }

    struct AcceptingMailer;

    #[async_trait]
    impl Mailer for AcceptingMailer {
        async fn send(&self, _email: &OutboundEmail) -> Result<(), MailError> {
            Ok(())
        }
    }

    const REPLY: &str = r#"[{"name": "Ann", "email": "ann@example.com", "channel_name": "AnnVlogs",
        "platform": "YouTube", "youtube_url": "https://youtube.com/@ann", "last_posted": "Unknown"}]"#;

    fn app_with(completion: Arc<dyn CompletionClient>) -> Router {
        let pipeline = OutreachPipeline::new(
            Arc::new(MemoryLeadStore::new()),
            completion,
            Arc::new(AcceptingMailer),
        );
        app(AppState::new(pipeline))
    }

    fn test_app(reply: &'static str) -> Router {
        app_with(Arc::new(FixedCompletion(reply)))
    }

    fn request(method: &str, uri: &str, owner: Option<OwnerId>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            builder = builder.header(OWNER_HEADER, owner.to_string());
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_is_open() {
        let app = test_app("[]");
        let (status, body) = send(&app, request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn requests_without_owner_are_unauthorized() {
        let app = test_app(REPLY);
        let (status, _) = send(&app, request("GET", "/leads", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            &app,
            request("POST", "/leads/analyze", None, Some(json!({ "text": "@ann" }))),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "no authenticated owner");
    }

    #[tokio::test]
    async fn analyze_dispatch_and_log_round_trip() {
        let app = test_app(REPLY);
        let owner = OwnerId::new();

        let (status, summary) = send(
            &app,
            request(
                "POST",
                "/leads/analyze",
                Some(owner),
                Some(json!({ "text": "https://youtube.com/@ann" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["analyzed"], 1);
        assert_eq!(summary["inserted"][0]["status"], "new");

        let (_, leads) = send(&app, request("GET", "/leads", Some(owner), None)).await;
        assert_eq!(leads.as_array().unwrap().len(), 1);

        let (status, result) = send(
            &app,
            request("POST", "/leads/dispatch", Some(owner), Some(json!({}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result, json!({ "processed": 1, "total": 1 }));

        let (_, emails) = send(&app, request("GET", "/emails", Some(owner), None)).await;
        let emails = emails.as_array().unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0]["status"], "sent");
        assert_eq!(emails[0]["subject"], "Quick question about your channel, Ann");

        // Nothing is left in `new`, so a default dispatch has no targets.
        let (status, _) = send(
            &app,
            request("POST", "/leads/dispatch", Some(owner), Some(json!({}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unparseable_analysis_is_unprocessable() {
        let app = test_app("no channels here");
        let (status, _) = send(
            &app,
            request("POST", "/leads/analyze", Some(OwnerId::new()), Some(json!({ "text": "@x" }))),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn gateway_failure_is_bad_gateway() {
        let app = app_with(Arc::new(UnreachableGateway));
        let owner = OwnerId::new();
        let (status, body) = send(
            &app,
            request("POST", "/leads/analyze", Some(owner), Some(json!({ "text": "@ann" }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("503"));

        let (_, leads) = send(&app, request("GET", "/leads", Some(owner), None)).await;
        assert!(leads.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn campaign_move_of_deleted_lead_is_not_found() {
        let app = test_app(REPLY);
        let owner = OwnerId::new();
        let (_, summary) = send(
            &app,
            request("POST", "/leads/analyze", Some(owner), Some(json!({ "text": "@ann" }))),
        )
        .await;
        let id = summary["inserted"][0]["id"].as_str().unwrap().to_string();

        let (status, _) = send(&app, request("DELETE", &format!("/leads/{id}"), Some(owner), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            &app,
            request("POST", "/leads/campaign", Some(owner), Some(json!({ "ids": [id] }))),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn deleting_unknown_lead_is_not_found() {
        let app = test_app("[]");
        let uri = format!("/leads/{}", Uuid::new_v4());
        let (status, _) = send(&app, request("DELETE", &uri, Some(OwnerId::new()), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn templates_are_validated_and_previewed() {
        let app = test_app("[]");
        let owner = OwnerId::new();

        let (status, _) = send(
            &app,
            request(
                "POST",
                "/templates",
                Some(owner),
                Some(json!({ "name": "", "subject": "s", "body": "b" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, created) = send(
            &app,
            request(
                "POST",
                "/templates",
                Some(owner),
                Some(json!({ "name": "Intro", "subject": "Hi {{name}}", "body": "About {{channel_name}}" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["name"], "Intro");

        let (_, listed) = send(&app, request("GET", "/templates", Some(owner), None)).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, preview) = send(
            &app,
            request(
                "POST",
                "/templates/preview",
                Some(owner),
                Some(json!({ "subject": "Hi {{name}}", "body": "About {{channel_name}}" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview, json!({ "subject": "Hi there", "body": "About your channel" }));
    }
}
