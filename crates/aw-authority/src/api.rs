// api.rs — HTTP surface of the authority.
//
// JSON in, JSON out. Agents use the `/agents/*` and `/audit` routes, the
// administration CLI uses the rest. Every error body carries the error kind
// so callers can branch on it, including bodies axum itself rejects.
// Store mutations write and sync files, so they run on the blocking pool.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use aw_audit::{AuditBatch, AuditError, AuditLog, AuditQuery, AuditRecord, SharedAuditLog};
use aw_rules::{
    Action, FirewallRule, Heartbeat, HeartbeatAck, InstanceId, MatchClause, PolicyAssignment,
    PolicyTemplate, PullRequest, PullResponse, Registration, RegistrationAck, RuleId,
    RuleSelector, RuleSetVersion,
};

use crate::catalog::{ApplicationCatalog, CatalogEntry};
use crate::config::AuthorityConfig;
use crate::distribution::{AgentRecord, DeltaPublisher, Distributor};
use crate::error::{DistributionError, StartupError, StoreError, WorkflowError};
use crate::store::{RuleStore, RuleUpdate, TemplateUpdate};
use crate::workflow::{BlockSelection, SearchAndBlock, SearchResult};

/// Everything the handlers share.
pub struct AppState {
    pub store: Arc<RuleStore>,
    pub distributor: Arc<Distributor>,
    pub workflow: Arc<SearchAndBlock>,
    pub catalog: Arc<ApplicationCatalog>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Open the store and central audit log under `config.state_dir`.
    pub fn open(config: &AuthorityConfig) -> Result<Self, StartupError> {
        let publisher = DeltaPublisher::new(config.push_capacity);
        let store = Arc::new(
            RuleStore::open(config.store_path())?
                .with_retention(config.change_log_retention)
                .with_publisher(publisher.clone()),
        );
        let audit = Arc::new(SharedAuditLog::open(config.audit_log())?);
        let catalog = Arc::new(ApplicationCatalog::seeded(config.catalog.clone()));
        let distributor = Arc::new(Distributor::new(
            store.clone(),
            publisher,
            audit,
            catalog.clone(),
        ));
        let existing = distributor.count_existing_audit()?;
        tracing::info!(records = existing, "central audit log opened");
        let workflow = Arc::new(SearchAndBlock::new(
            catalog.clone(),
            store.clone(),
            config.selection_ttl(),
        ));
        Ok(Self {
            store,
            distributor,
            workflow,
            catalog,
            started_at: Utc::now(),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/apps", get(list_apps))
        .route("/search", post(search))
        .route("/block", post(block))
        .route("/unblock", post(unblock))
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/{id}", get(get_rule).post(update_rule))
        .route("/templates", get(list_templates).post(create_template))
        .route(
            "/templates/{id}",
            get(get_template)
                .post(update_template)
                .delete(remove_template),
        )
        .route("/assignments", get(list_assignments).post(create_assignment))
        .route(
            "/assignments/{id}",
            get(get_assignment)
                .post(update_assignment)
                .delete(remove_assignment),
        )
        .route("/agents", get(list_agents))
        .route("/agents/register", post(register))
        .route("/agents/pull", post(pull))
        .route("/agents/heartbeat", post(heartbeat))
        .route("/agents/stream", get(agent_stream))
        .route("/audit", get(query_audit).post(upload_audit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Request and response bodies ────────────────────────────────

/// A rule without its scope, as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSpec {
    /// Keep an existing rule's identity when resubmitting a list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,
    pub clause: MatchClause,
    pub action: Action,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RuleSpec {
    pub fn into_rule(self, selector: RuleSelector) -> FirewallRule {
        let mut rule = FirewallRule::new(selector, self.clause, self.action, self.priority);
        if let Some(rule_id) = self.rule_id {
            rule.rule_id = rule_id;
        }
        rule.description = self.description;
        rule
    }
}

impl From<&FirewallRule> for RuleSpec {
    fn from(rule: &FirewallRule) -> Self {
        Self {
            rule_id: Some(rule.rule_id),
            clause: rule.clause.clone(),
            action: rule.action,
            priority: rule.priority,
            description: rule.description.clone(),
        }
    }
}

fn scoped(specs: Vec<RuleSpec>) -> Vec<FirewallRule> {
    specs
        .into_iter()
        .map(|s| s.into_rule(RuleSelector::Global))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuleRequest {
    pub selector: RuleSelector,
    #[serde(flatten)]
    pub rule: RuleSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRuleRequest {
    pub expected_revision: u64,
    #[serde(flatten)]
    pub update: RuleUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTemplateRequest {
    pub expected_revision: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rules: Option<Vec<RuleSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAssignmentRequest {
    pub template_id: Uuid,
    pub instance_id: InstanceId,
    #[serde(default)]
    pub overrides: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAssignmentRequest {
    pub expected_revision: u64,
    pub overrides: Vec<RuleSpec>,
}

/// `?expected_revision=N` on deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionParam {
    pub expected_revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub operator: String,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub operator: String,
    #[serde(flatten)]
    pub selection: BlockSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnblockRequest {
    pub rule_id: RuleId,
    pub expected_revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub endpoint_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Health {
    pub status: String,
    pub version: RuleSetVersion,
    pub agents: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorityStats {
    pub version: RuleSetVersion,
    pub rules: usize,
    pub active_rules: usize,
    pub templates: usize,
    pub assignments: usize,
    pub applications: usize,
    pub agents: usize,
    pub lagging_agents: usize,
    pub audit_records: usize,
    pub denied_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditAccepted {
    pub accepted: usize,
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    Workflow(WorkflowError),
    Distribution(DistributionError),
    Audit(AuditError),
    /// The request body or query string did not deserialize.
    Malformed { status: StatusCode, message: String },
    /// A blocking task panicked or was cancelled.
    Task(tokio::task::JoinError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Malformed {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Malformed {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        ApiError::Workflow(e)
    }
}

impl From<DistributionError> for ApiError {
    fn from(e: DistributionError) -> Self {
        ApiError::Distribution(e)
    }
}

impl From<AuditError> for ApiError {
    fn from(e: AuditError) -> Self {
        ApiError::Audit(e)
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::Conflict { .. } | StoreError::TemplateInUse { .. } => StatusCode::CONFLICT,
        StoreError::Malformed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Io { .. } | StoreError::SerializationError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message, reason) = match &self {
            ApiError::Store(e) => (store_status(e), e.kind(), e.to_string(), None),
            ApiError::Workflow(e) => {
                let (status, reason) = match e {
                    WorkflowError::StaleSelection { reason } => (StatusCode::GONE, Some(*reason)),
                    WorkflowError::InvalidOrdinal { .. } => (StatusCode::BAD_REQUEST, None),
                    WorkflowError::Store(inner) => (store_status(inner), None),
                };
                (status, e.kind(), e.to_string(), reason)
            }
            ApiError::Distribution(e) => {
                let status = match e {
                    DistributionError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
                    DistributionError::Audit(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.kind(), e.to_string(), None)
            }
            ApiError::Audit(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                e.to_string(),
                None,
            ),
            ApiError::Malformed { status, message } => (*status, "malformed", message.clone(), None),
            ApiError::Task(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                e.to_string(),
                None,
            ),
        };
        if status.is_server_error() {
            tracing::error!(error = %message, "request failed");
        }
        let mut body = serde_json::json!({
            "error": kind,
            "kind": kind,
            "message": message,
        });
        if let Some(reason) = reason {
            body["reason"] = serde_json::json!(reason);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// `Json` whose rejections use the `ApiError` body.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// `Query` whose rejections use the `ApiError` body.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    axum::extract::Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let axum::extract::Query(value) =
            axum::extract::Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

/// Run `f` on the blocking pool.
async fn blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ApiError::Task)?
        .map_err(Into::into)
}

fn created<T: Serialize>(value: T) -> (StatusCode, Json<T>) {
    (StatusCode::CREATED, Json(value))
}

// ── Handlers: overview ─────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        version: state.store.version(),
        agents: state.distributor.agents().len(),
        started_at: state.started_at,
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<AuthorityStats> {
    let snapshot = state.store.read();
    let tally = state.distributor.tally();
    Ok(Json(AuthorityStats {
        version: snapshot.ruleset.version,
        rules: snapshot.ruleset.rules.len(),
        active_rules: snapshot.ruleset.active_rule_count(),
        templates: snapshot.ruleset.templates.len(),
        assignments: snapshot.ruleset.assignments.len(),
        applications: state.catalog.len(),
        agents: state.distributor.agents().len(),
        lagging_agents: state.distributor.lagging_agents().len(),
        audit_records: tally.records(),
        denied_records: tally.denied(),
    }))
}

async fn list_apps(State(state): State<Arc<AppState>>) -> Json<Vec<CatalogEntry>> {
    Json(state.catalog.list())
}

// ── Handlers: search and block ─────────────────────────────────

async fn search(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SearchRequest>,
) -> Json<SearchResult> {
    Json(state.workflow.search(&req.operator, &req.query))
}

async fn block(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<BlockRequest>,
) -> Result<(StatusCode, Json<FirewallRule>), ApiError> {
    let rule = blocking(move || state.workflow.commit(&req.operator, req.selection)).await?;
    Ok(created(rule))
}

async fn unblock(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<UnblockRequest>,
) -> ApiResult<FirewallRule> {
    Ok(Json(
        blocking(move || state.workflow.unblock(req.rule_id, req.expected_revision)).await?,
    ))
}

// ── Handlers: rules ────────────────────────────────────────────

async fn list_rules(State(state): State<Arc<AppState>>) -> Json<Vec<FirewallRule>> {
    Json(state.store.list_rules())
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateRuleRequest>,
) -> Result<(StatusCode, Json<FirewallRule>), ApiError> {
    let rule = blocking(move || state.store.create_rule(req.rule.into_rule(req.selector))).await?;
    Ok(created(rule))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RuleId>,
) -> ApiResult<FirewallRule> {
    Ok(Json(state.store.get_rule(id)?))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RuleId>,
    ApiJson(req): ApiJson<UpdateRuleRequest>,
) -> ApiResult<FirewallRule> {
    Ok(Json(
        blocking(move || state.store.update_rule(id, req.expected_revision, req.update)).await?,
    ))
}

// ── Handlers: templates ────────────────────────────────────────

async fn list_templates(State(state): State<Arc<AppState>>) -> Json<Vec<PolicyTemplate>> {
    Json(state.store.list_templates())
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<PolicyTemplate>), ApiError> {
    let mut template = PolicyTemplate::new(req.name, scoped(req.rules));
    template.description = req.description;
    Ok(created(
        blocking(move || state.store.create_template(template)).await?,
    ))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<PolicyTemplate> {
    Ok(Json(state.store.get_template(id)?))
}

async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateTemplateRequest>,
) -> ApiResult<PolicyTemplate> {
    let update = TemplateUpdate {
        name: req.name,
        description: req.description,
        rules: req.rules.map(scoped),
    };
    Ok(Json(
        blocking(move || state.store.update_template(id, req.expected_revision, update)).await?,
    ))
}

async fn remove_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiQuery(param): ApiQuery<RevisionParam>,
) -> ApiResult<PolicyTemplate> {
    Ok(Json(
        blocking(move || state.store.remove_template(id, param.expected_revision)).await?,
    ))
}

// ── Handlers: assignments ──────────────────────────────────────

async fn list_assignments(State(state): State<Arc<AppState>>) -> Json<Vec<PolicyAssignment>> {
    Json(state.store.list_assignments())
}

async fn create_assignment(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateAssignmentRequest>,
) -> Result<(StatusCode, Json<PolicyAssignment>), ApiError> {
    let assignment = PolicyAssignment::new(req.template_id, req.instance_id)
        .with_overrides(scoped(req.overrides));
    Ok(created(
        blocking(move || state.store.create_assignment(assignment)).await?,
    ))
}

async fn get_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<PolicyAssignment> {
    Ok(Json(state.store.get_assignment(id)?))
}

async fn update_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiJson(req): ApiJson<UpdateAssignmentRequest>,
) -> ApiResult<PolicyAssignment> {
    Ok(Json(
        blocking(move || {
            state
                .store
                .update_assignment(id, req.expected_revision, scoped(req.overrides))
        })
        .await?,
    ))
}

async fn remove_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiQuery(param): ApiQuery<RevisionParam>,
) -> ApiResult<PolicyAssignment> {
    Ok(Json(
        blocking(move || state.store.remove_assignment(id, param.expected_revision)).await?,
    ))
}

// ── Handlers: agents ───────────────────────────────────────────

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentRecord>> {
    Json(state.distributor.agents())
}

async fn register(
    State(state): State<Arc<AppState>>,
    ApiJson(registration): ApiJson<Registration>,
) -> Json<RegistrationAck> {
    Json(state.distributor.register(registration))
}

async fn pull(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<PullRequest>,
) -> Json<PullResponse> {
    Json(state.distributor.pull(&request))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    ApiJson(heartbeat): ApiJson<Heartbeat>,
) -> ApiResult<HeartbeatAck> {
    Ok(Json(state.distributor.heartbeat(heartbeat)?))
}

/// Server-sent events: one `delta` event per committed rule-set version.
async fn agent_stream(
    State(state): State<Arc<AppState>>,
    ApiQuery(params): ApiQuery<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let endpoint = params.endpoint_id.unwrap_or_else(|| "-".to_string());
    tracing::info!(endpoint = %endpoint, "push stream opened");

    let rx = state.distributor.subscribe();
    let stream = BroadcastStream::new(rx).map(move |msg| match msg {
        Ok(notice) => match serde_json::to_string(&notice) {
            Ok(json) => Ok(Event::default().event("delta").data(json)),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize push notice");
                Ok(Event::default().comment("serialization error"))
            }
        },
        // The agent detects the gap on the next delta and pulls.
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            tracing::warn!(endpoint = %endpoint, missed, "push subscriber lagged");
            Ok(Event::default().comment(format!("lagged {}", missed)))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Handlers: audit ────────────────────────────────────────────

async fn upload_audit(
    State(state): State<Arc<AppState>>,
    ApiJson(batch): ApiJson<AuditBatch>,
) -> ApiResult<AuditAccepted> {
    let accepted = blocking(move || state.distributor.ingest_audit(batch)).await?;
    Ok(Json(AuditAccepted { accepted }))
}

async fn query_audit(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<AuditQuery>,
) -> ApiResult<Vec<AuditRecord>> {
    let path = state.distributor.audit().path()?;
    Ok(Json(
        blocking(move || AuditLog::query(&path, &query)).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use aw_rules::ApplicationIdentity;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        _dir: tempfile::TempDir,
        app: Router,
    }

    fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AuthorityConfig::for_dir(dir.path());
        config.catalog = vec![
            ApplicationIdentity::new("Firefox").with_publisher("Mozilla"),
            ApplicationIdentity::new("FireFTP"),
            ApplicationIdentity::new("Slack"),
        ];
        let state = Arc::new(AppState::open(&config).unwrap());
        TestApp {
            _dir: dir,
            app: router(state),
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(serde_json::to_vec(&v).unwrap()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn global_rule(domain: &str) -> Value {
        json!({
            "selector": {"scope": "global"},
            "clause": {"kind": "domain", "pattern": domain},
            "action": "deny",
            "priority": 5
        })
    }

    #[tokio::test]
    async fn health_reports_version() {
        let t = app();
        let (status, body) = call(&t.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], 0);
    }

    #[tokio::test]
    async fn rule_crud_with_optimistic_concurrency() {
        let t = app();
        let (status, rule) = call(&t.app, "POST", "/rules", Some(global_rule("x.com"))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = rule["rule_id"].as_str().unwrap().to_string();
        assert_eq!(rule["revision"], 1);

        let (status, fetched) = call(&t.app, "GET", &format!("/rules/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["clause"]["pattern"], "x.com");

        let (status, updated) = call(
            &t.app,
            "POST",
            &format!("/rules/{}", id),
            Some(json!({"expected_revision": 1, "state": "disabled"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["state"], "disabled");

        // Same stale revision again.
        let (status, err) = call(
            &t.app,
            "POST",
            &format!("/rules/{}", id),
            Some(json!({"expected_revision": 1, "priority": 9})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["kind"], "conflict");

        let (_, health) = call(&t.app, "GET", "/health", None).await;
        assert_eq!(health["version"], 2);
    }

    #[tokio::test]
    async fn malformed_and_missing_rules() {
        let t = app();
        let (status, err) = call(&t.app, "POST", "/rules", Some(global_rule("*.*.com"))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["error"], "malformed");

        let (status, err) = call(
            &t.app,
            "GET",
            &format!("/rules/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "not_found");
    }

    #[tokio::test]
    async fn rejected_bodies_carry_the_error_kind() {
        let t = app();
        let bad_cidr = json!({
            "selector": {"scope": "global"},
            "clause": {"kind": "network", "cidr": "300.1.1.1/8"},
            "action": "deny",
            "priority": 0
        });
        let (status, err) = call(&t.app, "POST", "/rules", Some(bad_cidr)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["kind"], "malformed");
        assert!(err["message"].as_str().is_some_and(|m| !m.is_empty()));

        let request = Request::builder()
            .method("POST")
            .uri("/search")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let err: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(err["kind"], "malformed");

        let (status, err) = call(
            &t.app,
            "DELETE",
            &format!("/templates/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["kind"], "malformed");
    }

    #[tokio::test]
    async fn search_then_block_the_exact_candidate() {
        let t = app();
        let (status, result) = call(
            &t.app,
            "POST",
            "/search",
            Some(json!({"operator": "alice", "query": "fire"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["candidates"][0]["identity"]["name"], "Firefox");
        assert_eq!(result["candidates"][1]["identity"]["name"], "FireFTP");

        let (status, rule) = call(
            &t.app,
            "POST",
            "/block",
            Some(json!({
                "operator": "alice",
                "session_id": result["session_id"],
                "ordinal": 1,
                "clause": {"kind": "domain", "pattern": "x.com"},
                "expected_digest": result["digest"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(rule["selector"]["identity"]["name"], "Firefox");
        assert_eq!(rule["action"], "deny");

        let (status, removed) = call(
            &t.app,
            "POST",
            "/unblock",
            Some(json!({"rule_id": rule["rule_id"], "expected_revision": rule["revision"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(removed["rule_id"], rule["rule_id"]);
    }

    #[tokio::test]
    async fn stale_selection_is_410() {
        let t = app();
        let (_, first) = call(
            &t.app,
            "POST",
            "/search",
            Some(json!({"operator": "alice", "query": "fire"})),
        )
        .await;
        call(
            &t.app,
            "POST",
            "/search",
            Some(json!({"operator": "alice", "query": "slack"})),
        )
        .await;
        let (status, err) = call(
            &t.app,
            "POST",
            "/block",
            Some(json!({
                "operator": "alice",
                "session_id": first["session_id"],
                "ordinal": 1,
                "clause": {"kind": "domain", "pattern": "x.com"},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(err["error"], "stale_selection");
        assert_eq!(err["reason"], "superseded");
    }

    #[tokio::test]
    async fn out_of_range_ordinal_is_400() {
        let t = app();
        let (_, result) = call(
            &t.app,
            "POST",
            "/search",
            Some(json!({"operator": "bob", "query": "slack"})),
        )
        .await;
        let (status, err) = call(
            &t.app,
            "POST",
            "/block",
            Some(json!({
                "operator": "bob",
                "session_id": result["session_id"],
                "ordinal": 4,
                "clause": {"kind": "domain", "pattern": "x.com"},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "invalid_ordinal");
    }

    #[tokio::test]
    async fn template_in_use_cannot_be_deleted() {
        let t = app();
        let (status, template) = call(
            &t.app,
            "POST",
            "/templates",
            Some(json!({
                "name": "browsers",
                "rules": [{"clause": {"kind": "domain", "pattern": "*.ads.example"}, "action": "deny"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let template_id = template["template_id"].as_str().unwrap().to_string();

        let (status, assignment) = call(
            &t.app,
            "POST",
            "/assignments",
            Some(json!({"template_id": template_id, "instance_id": Uuid::new_v4()})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, err) = call(
            &t.app,
            "DELETE",
            &format!("/templates/{}?expected_revision={}", template_id, template["revision"]),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "template_in_use");

        let (status, updated) = call(
            &t.app,
            "POST",
            &format!("/assignments/{}", assignment["assignment_id"].as_str().unwrap()),
            Some(json!({
                "expected_revision": assignment["revision"],
                "overrides": [{"clause": {"kind": "domain", "pattern": "ok.ads.example"}, "action": "allow"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["overrides"][0]["action"], "allow");
    }

    #[tokio::test]
    async fn agent_lifecycle_over_http() {
        let t = app();
        call(&t.app, "POST", "/rules", Some(global_rule("x.com"))).await;

        let (status, ack) = call(
            &t.app,
            "POST",
            "/agents/register",
            Some(json!({
                "endpoint_id": "e1",
                "hostname": "laptop",
                "capabilities": ["memory"],
                "applied_version": 0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["current_version"], 1);

        let (_, pulled) = call(
            &t.app,
            "POST",
            "/agents/pull",
            Some(json!({"endpoint_id": "e1", "since_version": 0})),
        )
        .await;
        assert_eq!(pulled["kind"], "deltas");

        let (_, hb) = call(
            &t.app,
            "POST",
            "/agents/heartbeat",
            Some(json!({"endpoint_id": "e1", "applied_version": 0, "sent_at": Utc::now()})),
        )
        .await;
        assert_eq!(hb["behind"], true);

        let (_, stats) = call(&t.app, "GET", "/stats", None).await;
        assert_eq!(stats["lagging_agents"], 1);
        assert_eq!(stats["rules"], 1);

        let (status, err) = call(
            &t.app,
            "POST",
            "/agents/heartbeat",
            Some(json!({"endpoint_id": "ghost", "applied_version": 0, "sent_at": Utc::now()})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "unknown_endpoint");
    }

    #[tokio::test]
    async fn audit_upload_and_query() {
        let t = app();
        let record = AuditRecord::decision(
            "e1",
            Action::Deny,
            aw_audit::Enforcement::Terminated,
            aw_audit::FlowMetadata::new("203.0.113.9".parse().unwrap(), 443, aw_rules::Protocol::Tcp),
        );
        let (status, accepted) = call(
            &t.app,
            "POST",
            "/audit",
            Some(json!({"endpoint_id": "e1", "records": [record]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted["accepted"], 1);

        let (status, records) = call(&t.app, "GET", "/audit?endpoint=e1&limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(records.as_array().unwrap().len(), 1);
        assert_eq!(records[0]["flow"]["service"], "HTTPS");

        let (_, stats) = call(&t.app, "GET", "/stats", None).await;
        assert_eq!(stats["audit_records"], 1);
        assert_eq!(stats["denied_records"], 1);
    }
}
