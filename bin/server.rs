// Tagledger - Web Server
// REST API with Axum: transaction queries, rule CRUD, rule application

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use tagledger::{
    apply_all_rules, apply_one_rule, create_rule, delete_rule, get_rule, list_rules,
    open_database, reload_and_reclassify, update_rule, NewRule, PageLimits, QueryParams,
    QuerySummary, RulePatch, RuleSource, Settings, TransactionQuery, TransactionRow,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    limits: PageLimits,
    rules_file: PathBuf,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::internal("database lock poisoned"))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Client input → 400, missing rule/transaction → 404, everything else → 500
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }
}

impl From<tagledger::Error> for ApiError {
    fn from(err: tagledger::Error) -> Self {
        let status = if err.is_not_found() {
            StatusCode::NOT_FOUND
        } else if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            success: false,
            data: (),
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Serialize)]
struct TransactionsResponse {
    summary: QuerySummary,
    transactions: Vec<TransactionRow>,
}

#[derive(Serialize)]
struct RuleApplied<T> {
    #[serde(flatten)]
    rule: T,
    classified: usize,
}

#[derive(Deserialize, Default)]
struct ApplyRequest {
    #[serde(default)]
    txids: Option<Vec<String>>,
}

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/transactions?rule=&ruleid=&filter=&order_by=&page=&page_size=
async fn get_transactions(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> ApiResult<TransactionsResponse> {
    let conn = state.conn()?;
    let query = TransactionQuery::build(&conn, &params, &state.limits)?;

    Ok(Json(ApiResponse::ok(TransactionsResponse {
        summary: query.summary(&conn)?,
        transactions: query.transactions(&conn, true)?,
    })))
}

/// GET /api/rules - All rules with their transaction counts
async fn get_rules(State(state): State<AppState>) -> ApiResult<Vec<tagledger::RuleSummary>> {
    let conn = state.conn()?;
    Ok(Json(ApiResponse::ok(list_rules(&conn)?)))
}

/// POST /api/rule - Create a rule and classify with it
async fn post_rule(
    State(state): State<AppState>,
    Json(new_rule): Json<NewRule>,
) -> Result<(StatusCode, Json<ApiResponse<RuleApplied<tagledger::Rule>>>), ApiError> {
    let conn = state.conn()?;
    let rule = create_rule(&conn, &new_rule)?;
    let classified = tagledger::apply_rule(&conn, &rule, None)?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(RuleApplied { rule, classified })),
    ))
}

/// GET /api/rule/:id
async fn get_rule_by_id(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<tagledger::Rule> {
    let conn = state.conn()?;
    Ok(Json(ApiResponse::ok(get_rule(&conn, id)?)))
}

/// PATCH /api/rule/:id - Update, then reapply the rule
async fn patch_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<RulePatch>,
) -> ApiResult<RuleApplied<tagledger::Rule>> {
    let conn = state.conn()?;
    let rule = update_rule(&conn, id, &patch)?;
    let classified = apply_one_rule(&conn, id)?;
    Ok(Json(ApiResponse::ok(RuleApplied { rule, classified })))
}

/// DELETE /api/rule/:id
async fn remove_rule(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<String> {
    let conn = state.conn()?;
    delete_rule(&conn, id)?;
    Ok(Json(ApiResponse::ok(format!("Rule {} deleted", id))))
}

/// POST /api/rules/apply - Clear and reapply every stored rule
async fn apply_rules(
    State(state): State<AppState>,
    body: Option<Json<ApplyRequest>>,
) -> ApiResult<tagledger::ApplyReport> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let conn = state.conn()?;
    let report = apply_all_rules(&conn, request.txids.as_deref())?;
    Ok(Json(ApiResponse::ok(report)))
}

/// POST /api/rules/reclassify - Reload the rule file and reclassify everything
async fn reclassify(State(state): State<AppState>) -> ApiResult<tagledger::ClassifyReport> {
    let conn = state.conn()?;
    let source = RuleSource::File(state.rules_file.clone());
    Ok(Json(ApiResponse::ok(reload_and_reclassify(&conn, &source)?)))
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/transactions", get(get_transactions))
        .route("/rules", get(get_rules))
        .route("/rule", post(post_rule))
        .route(
            "/rule/:id",
            get(get_rule_by_id).patch(patch_rule).delete(remove_rule),
        )
        .route("/rules/apply", post(apply_rules))
        .route("/rules/reclassify", post(reclassify))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use anyhow::Context;

    let config_file = std::env::var_os("TAGLEDGER_CONFIG").map(PathBuf::from);
    let settings = Settings::load(config_file.as_deref()).context("Failed to load settings")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "tagledger={level},tagledger_server={level},tower_http={level}",
                    level = settings.log.level
                ))
            }),
        )
        .init();

    let conn = open_database(&settings.database.path)
        .with_context(|| format!("Failed to open database {:?}", settings.database.path))?;

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        limits: settings.page_limits(),
        rules_file: settings.rules.file.clone(),
    };

    let addr = settings.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(%addr, "server running");
    axum::serve(listener, router(state))
        .await
        .context("Server error")?;
    Ok(())
}
