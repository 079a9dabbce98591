use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ApiKey;
use larder_core::Error;
use larder_core::models::{
    CompletionSummary, EntityChanges, EntityType, MealPlan, MealPlanEntry, NewMealPlanEntry,
    NewPantryItem, NewRecipe, NewShoppingItem, NewShoppingList, PantryItem, PushOutcome, Recipe,
    ShoppingItem, ShoppingList, SyncPayload, SyncPush, UpdatePantryItem, UpdateRecipe,
    UpdateShoppingItem, Watermarks, parse_week_start,
};
use larder_core::service::{Deadlines, LarderService};

const BODY_LIMIT: usize = 50 * 1024 * 1024; // 50 MB

/// Dev-mode owner header, honoured only with `--no-auth`.
const OWNER_HEADER: &str = "x-larder-owner";
const DEFAULT_OWNER: &str = "local";

#[derive(Clone)]
enum Auth {
    /// Bearer key → owner id.
    Keys(Arc<HashMap<String, String>>),
    Trusted,
}

#[derive(Clone)]
struct AppState {
    db_path: Arc<PathBuf>,
    deadlines: Deadlines,
    auth: Auth,
}

/// Authenticated account, inserted by [`require_auth`].
#[derive(Debug, Clone)]
struct Owner(String);

// --- Request / Response types ---

#[derive(Deserialize)]
struct SinceQuery {
    since: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RenameListRequest {
    name: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

#[derive(Serialize)]
struct ErasedResponse {
    removed: usize,
}

// --- Error handling ---

enum ApiError {
    Core(Error),
    BadRequest(String),
    Unauthorized,
    Internal(anyhow::Error),
}

type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            Self::Core(err) => {
                let status = match &err {
                    Error::NotFound { .. } => StatusCode::NOT_FOUND,
                    Error::AlreadyExists(_) | Error::LockContended { .. } => StatusCode::CONFLICT,
                    Error::Invalid(_) => StatusCode::BAD_REQUEST,
                    Error::TransactionAborted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    Error::Decode(_) | Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let code = err.code();
                if status.is_server_error() {
                    if err.is_retryable() {
                        warn!(code, "retryable failure: {err}");
                    } else {
                        error!(code, "internal error: {err}");
                    }
                }
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "Internal server error".to_string()
                } else if err.is_retryable() {
                    format!("{err}; safe to retry")
                } else {
                    err.to_string()
                };
                (status, message, code)
            }
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "INVALID"),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Invalid or missing API key".to_string(),
                "UNAUTHORIZED",
            ),
            Self::Internal(err) => {
                error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL",
                )
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: message,
                code,
            }),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Core(err)
    }
}

/// Run store work on the blocking pool with a fresh connection.
async fn with_service<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&LarderService) -> larder_core::Result<T> + Send + 'static,
{
    let path = Arc::clone(&state.db_path);
    let deadlines = state.deadlines;
    tokio::task::spawn_blocking(move || {
        let service = LarderService::open(&path, deadlines)?;
        f(&service)
    })
    .await
    .context("store task panicked")
    .map_err(ApiError::Internal)?
    .map_err(ApiError::from)
}

// --- Middleware ---

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let owner = match &state.auth {
        Auth::Keys(keys) => request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .and_then(|token| keys.get(token))
            .cloned(),
        Auth::Trusted => Some(
            request
                .headers()
                .get(OWNER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(DEFAULT_OWNER)
                .to_string(),
        ),
    };

    let Some(owner) = owner else {
        return ApiError::Unauthorized.into_response();
    };
    request.extensions_mut().insert(Owner(owner));
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Sync handlers ---

async fn pull(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Query(since): Query<Watermarks>,
) -> ApiResult<Json<SyncPayload>> {
    let payload = with_service(&state, move |svc| svc.pull(&owner, &since)).await?;
    Ok(Json(payload))
}

async fn entity_changes(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(entity_type): Path<String>,
    Query(query): Query<SinceQuery>,
) -> ApiResult<Json<EntityChanges>> {
    let entity = EntityType::parse(&entity_type)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown entity type '{entity_type}'")))?;
    let changes = with_service(&state, move |svc| {
        svc.changes_since(&owner, entity, query.since)
    })
    .await?;
    Ok(Json(changes))
}

async fn push(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Json(req): Json<SyncPush>,
) -> ApiResult<Json<PushOutcome>> {
    let outcome = with_service(&state, move |svc| svc.push(&owner, &req)).await?;
    Ok(Json(outcome))
}

// --- Recipe handlers ---

async fn list_recipes(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> ApiResult<Json<Vec<Recipe>>> {
    Ok(Json(
        with_service(&state, move |svc| svc.list_recipes(&owner)).await?,
    ))
}

async fn list_public_recipes(State(state): State<AppState>) -> ApiResult<Json<Vec<Recipe>>> {
    Ok(Json(
        with_service(&state, LarderService::list_public_recipes).await?,
    ))
}

async fn create_recipe(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Json(req): Json<NewRecipe>,
) -> ApiResult<(StatusCode, Json<Recipe>)> {
    let recipe = with_service(&state, move |svc| svc.create_recipe(&owner, &req)).await?;
    Ok((StatusCode::CREATED, Json(recipe)))
}

async fn get_recipe(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<Json<Recipe>> {
    Ok(Json(
        with_service(&state, move |svc| svc.get_recipe(&owner, &id)).await?,
    ))
}

async fn update_recipe(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRecipe>,
) -> ApiResult<Json<Recipe>> {
    Ok(Json(
        with_service(&state, move |svc| svc.update_recipe(&owner, &id, &req)).await?,
    ))
}

async fn delete_recipe(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    with_service(&state, move |svc| svc.delete_recipe(&owner, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clone_recipe(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Recipe>)> {
    let recipe = with_service(&state, move |svc| svc.clone_recipe(&owner, &id)).await?;
    Ok((StatusCode::CREATED, Json(recipe)))
}

// --- Pantry handlers ---

async fn list_pantry(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> ApiResult<Json<Vec<PantryItem>>> {
    Ok(Json(
        with_service(&state, move |svc| svc.list_pantry(&owner)).await?,
    ))
}

async fn add_pantry_item(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Json(req): Json<NewPantryItem>,
) -> ApiResult<Json<PantryItem>> {
    Ok(Json(
        with_service(&state, move |svc| svc.add_pantry_item(&owner, &req)).await?,
    ))
}

async fn get_pantry_item(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<Json<PantryItem>> {
    Ok(Json(
        with_service(&state, move |svc| svc.get_pantry_item(&owner, &id)).await?,
    ))
}

async fn update_pantry_item(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
    Json(req): Json<UpdatePantryItem>,
) -> ApiResult<Json<PantryItem>> {
    Ok(Json(
        with_service(&state, move |svc| {
            svc.update_pantry_item(&owner, &id, &req)
        })
        .await?,
    ))
}

async fn delete_pantry_item(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    with_service(&state, move |svc| svc.delete_pantry_item(&owner, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Shopping list handlers ---

async fn list_lists(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> ApiResult<Json<Vec<ShoppingList>>> {
    Ok(Json(
        with_service(&state, move |svc| svc.list_lists(&owner)).await?,
    ))
}

async fn create_list(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Json(req): Json<NewShoppingList>,
) -> ApiResult<(StatusCode, Json<ShoppingList>)> {
    let list = with_service(&state, move |svc| svc.create_list(&owner, &req)).await?;
    Ok((StatusCode::CREATED, Json(list)))
}

async fn get_list(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<Json<ShoppingList>> {
    Ok(Json(
        with_service(&state, move |svc| svc.get_list(&owner, &id)).await?,
    ))
}

async fn rename_list(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
    Json(req): Json<RenameListRequest>,
) -> ApiResult<Json<ShoppingList>> {
    Ok(Json(
        with_service(&state, move |svc| svc.rename_list(&owner, &id, &req.name)).await?,
    ))
}

async fn delete_list(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    with_service(&state, move |svc| svc.delete_list(&owner, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_items(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(list_id): Path<String>,
) -> ApiResult<Json<Vec<ShoppingItem>>> {
    Ok(Json(
        with_service(&state, move |svc| svc.list_items(&owner, &list_id)).await?,
    ))
}

async fn add_item(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(list_id): Path<String>,
    Json(req): Json<NewShoppingItem>,
) -> ApiResult<(StatusCode, Json<ShoppingItem>)> {
    let item = with_service(&state, move |svc| svc.add_item(&owner, &list_id, &req)).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn complete_list(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(list_id): Path<String>,
) -> ApiResult<Json<CompletionSummary>> {
    Ok(Json(
        with_service(&state, move |svc| svc.complete_list(&owner, &list_id)).await?,
    ))
}

async fn import_recipe(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path((list_id, recipe_id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Vec<ShoppingItem>>)> {
    let items = with_service(&state, move |svc| {
        svc.import_recipe(&owner, &list_id, &recipe_id)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(items)))
}

async fn get_item(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<Json<ShoppingItem>> {
    Ok(Json(
        with_service(&state, move |svc| svc.get_item(&owner, &id)).await?,
    ))
}

async fn update_item(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
    Json(req): Json<UpdateShoppingItem>,
) -> ApiResult<Json<ShoppingItem>> {
    Ok(Json(
        with_service(&state, move |svc| svc.update_item(&owner, &id, &req)).await?,
    ))
}

async fn delete_item(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    with_service(&state, move |svc| svc.delete_item(&owner, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Meal plan handlers ---

async fn get_meal_plan(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(week): Path<String>,
) -> ApiResult<Json<MealPlan>> {
    Ok(Json(
        with_service(&state, move |svc| {
            svc.get_meal_plan(&owner, parse_week_start(&week)?)
        })
        .await?,
    ))
}

/// Idempotent: returns the week's plan, creating or restoring it.
async fn ensure_meal_plan(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(week): Path<String>,
) -> ApiResult<Json<MealPlan>> {
    Ok(Json(
        with_service(&state, move |svc| {
            svc.meal_plan(&owner, parse_week_start(&week)?)
        })
        .await?,
    ))
}

async fn delete_meal_plan(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(week): Path<String>,
) -> ApiResult<StatusCode> {
    with_service(&state, move |svc| {
        svc.delete_meal_plan(&owner, parse_week_start(&week)?)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_entries(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(week): Path<String>,
) -> ApiResult<Json<Vec<MealPlanEntry>>> {
    Ok(Json(
        with_service(&state, move |svc| {
            svc.list_meal_plan_entries(&owner, parse_week_start(&week)?)
        })
        .await?,
    ))
}

async fn add_entry(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(week): Path<String>,
    Json(req): Json<NewMealPlanEntry>,
) -> ApiResult<(StatusCode, Json<MealPlanEntry>)> {
    let entry = with_service(&state, move |svc| {
        svc.add_meal_plan_entry(&owner, parse_week_start(&week)?, &req)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn remove_entry(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    with_service(&state, move |svc| svc.remove_meal_plan_entry(&owner, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Account ---

async fn erase_account(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> ApiResult<Json<ErasedResponse>> {
    let removed = with_service(&state, move |svc| svc.erase_account(&owner)).await?;
    Ok(Json(ErasedResponse { removed }))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", get(pull).post(push))
        .route("/api/sync/{entity_type}", get(entity_changes))
        .route("/api/recipes", get(list_recipes).post(create_recipe))
        .route("/api/recipes/public", get(list_public_recipes))
        .route(
            "/api/recipes/{id}",
            get(get_recipe).put(update_recipe).delete(delete_recipe),
        )
        .route("/api/recipes/{id}/clone", post(clone_recipe))
        .route("/api/pantry", get(list_pantry).post(add_pantry_item))
        .route(
            "/api/pantry/{id}",
            get(get_pantry_item)
                .put(update_pantry_item)
                .delete(delete_pantry_item),
        )
        .route("/api/shopping-lists", get(list_lists).post(create_list))
        .route(
            "/api/shopping-lists/{id}",
            get(get_list).put(rename_list).delete(delete_list),
        )
        .route(
            "/api/shopping-lists/{id}/items",
            get(list_items).post(add_item),
        )
        .route("/api/shopping-lists/{id}/complete", post(complete_list))
        .route(
            "/api/shopping-lists/{id}/import-recipe/{recipe_id}",
            post(import_recipe),
        )
        .route(
            "/api/shopping-items/{id}",
            get(get_item).put(update_item).delete(delete_item),
        )
        .route(
            "/api/meal-plans/{week_start}",
            get(get_meal_plan)
                .put(ensure_meal_plan)
                .delete(delete_meal_plan),
        )
        .route(
            "/api/meal-plans/{week_start}/entries",
            get(list_entries).post(add_entry),
        )
        .route("/api/meal-plan-entries/{id}", delete(remove_entry))
        .route("/api/account", delete(erase_account))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    db_path: PathBuf,
    port: u16,
    bind: &str,
    api_keys: Option<Vec<ApiKey>>,
    deadlines: Deadlines,
    new_api_keys: bool,
) -> anyhow::Result<()> {
    // Fail fast on an unusable database and run migrations once up front.
    LarderService::open(&db_path, deadlines)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    let auth = match &api_keys {
        Some(keys) => {
            if new_api_keys {
                for key in keys {
                    eprintln!("Generated API key for '{}': {}", key.owner_id, key.key);
                    eprintln!("Include in requests: Authorization: Bearer {}", key.key);
                }
            } else {
                eprintln!("{} API key(s) loaded (see api_keys.json in data directory)", keys.len());
            }
            Auth::Keys(Arc::new(
                keys.iter()
                    .map(|k| (k.key.clone(), k.owner_id.clone()))
                    .collect(),
            ))
        }
        None => {
            eprintln!(
                "Warning: Authentication disabled (--no-auth). Requests act as the {OWNER_HEADER} header's owner."
            );
            if bind != "127.0.0.1" && bind != "localhost" {
                eprintln!(
                    "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
                );
            }
            Auth::Trusted
        }
    };

    let state = AppState {
        db_path: Arc::new(db_path),
        deadlines,
        auth,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!(
        "listening on http://{bind}:{port} (read deadline {:?}, write deadline {:?})",
        deadlines.read, deadlines.write
    );
    axum::serve(listener, app).await?;

    Ok(())
}
