use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path as UrlPath, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::{self, CurrentUser, UserStore},
    country,
    error::ScanError,
    inventory::{DeviceFilter, PageRequest, SearchQuery, SortOrder},
    scanner::Scanner,
    targets,
    types::{ProbeTarget, ScanConfig},
};

#[derive(Clone)]
pub struct AppState {
    pub scanner: Scanner,
    pub users: Arc<UserStore>,
}

impl AppState {
    pub fn new(scanner: Scanner, users: UserStore) -> Self {
        Self {
            scanner,
            users: Arc::new(users),
        }
    }
}

/// `{success, message}` body used by control endpoints and all errors.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

/// HTTP rendering of a [`ScanError`].
pub struct ApiError(pub ScanError);

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_config_error() => StatusCode::BAD_REQUEST,
            ScanError::ScanAlreadyRunning | ScanError::NotRunning | ScanError::NotPaused => {
                StatusCode::CONFLICT
            }
            ScanError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ScanError::CountryLookup(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Ack {
            success: false,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// `Json` extractor whose rejections render as [`ApiError`] 400s.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ScanError::InvalidConfig(rejection.body_text()).into()),
        }
    }
}

/// Build the full application: authenticated `/api`, login/logout, static UI fallback.
pub fn router(state: AppState, ui_dir: &Path) -> Router {
    let protected = Router::new()
        .route("/scan", post(post_scan))
        .route("/scan/pause", post(post_pause))
        .route("/scan/resume", post(post_resume))
        .route("/scan/stop", post(post_stop))
        .route("/scan/device", post(post_scan_device))
        .route("/scan/history", get(get_scan_history))
        .route("/status", get(get_status))
        .route("/devices", get(get_devices))
        .route("/history", get(get_history))
        .route("/search", get(get_search))
        .route("/countries", get(get_countries))
        .route("/country/{code}/ranges", get(get_country_ranges))
        .route("/preview", post(post_preview))
        .route("/export", get(get_export))
        .route("/users/current", get(get_current_user))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let api = Router::new()
        .route("/login", post(post_login))
        .route("/logout", post(post_logout))
        .merge(protected)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state);

    let static_svc = ServeDir::new(ui_dir).append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(bind: &str, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("serving API and UI on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;
    Ok(())
}

async fn require_auth(State(app): State<AppState>, mut req: Request, next: Next) -> Response {
    match app.users.authenticate(req.headers()) {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

fn parse_port_param(raw: Option<&str>) -> ApiResult<Option<u16>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .map(Some)
            .ok_or_else(|| ScanError::InvalidConfig(format!("invalid port: {s}")).into()),
    }
}

#[derive(Debug, Serialize)]
struct ScanStarted {
    success: bool,
    message: String,
    total_targets: u64,
}

async fn post_scan(State(app): State<AppState>, ApiJson(config): ApiJson<ScanConfig>) -> ApiResult<impl IntoResponse> {
    let total = app.scanner.start(config).await?;
    Ok(Json(ScanStarted {
        success: true,
        message: format!("Scan started for {total} targets"),
        total_targets: total,
    }))
}

async fn post_pause(State(app): State<AppState>) -> ApiResult<Json<Ack>> {
    app.scanner.pause().await?;
    Ok(Ack::ok("Scan paused"))
}

async fn post_resume(State(app): State<AppState>) -> ApiResult<Json<Ack>> {
    app.scanner.resume().await?;
    Ok(Ack::ok("Scan resumed"))
}

async fn post_stop(State(app): State<AppState>) -> ApiResult<Json<Ack>> {
    app.scanner.stop().await?;
    Ok(Ack::ok("Scan stopped"))
}

#[derive(Debug, Deserialize)]
struct DeviceScanRequest {
    ip: Ipv4Addr,
    port: u16,
}

async fn post_scan_device(
    State(app): State<AppState>,
    ApiJson(req): ApiJson<DeviceScanRequest>,
) -> ApiResult<Json<Ack>> {
    if req.port == 0 {
        return Err(ScanError::InvalidConfig("port must be between 1 and 65535".into()).into());
    }
    let target = ProbeTarget::new(req.ip, req.port);
    // Fire and forget: the result lands in the inventory.
    drop(app.scanner.rescan(target));
    Ok(Ack::ok(format!("Rescan of {target} queued")))
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.scanner.status().await)
}

#[derive(Debug, Deserialize)]
struct DevicesParams {
    ip: Option<String>,
    port: Option<String>,
    sort: Option<String>,
    limit: Option<usize>,
}

async fn get_devices(State(app): State<AppState>, Query(p): Query<DevicesParams>) -> ApiResult<impl IntoResponse> {
    let filter = DeviceFilter {
        ip: p.ip,
        port: parse_port_param(p.port.as_deref())?,
    };
    let sort: SortOrder = p
        .sort
        .as_deref()
        .unwrap_or("")
        .parse()
        .map_err(ScanError::InvalidConfig)?;
    let limit = p.limit.unwrap_or(app.scanner.config().default_page_size);
    let mut devices = app.scanner.inventory().list(&filter, sort).await;
    devices.truncate(limit);
    Ok(Json(devices))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    page: Option<usize>,
    per_page: Option<usize>,
}

impl PageParams {
    fn request(&self, default_size: usize) -> PageRequest {
        PageRequest::new(self.page.unwrap_or(1), self.per_page.unwrap_or(default_size))
    }
}

async fn get_history(State(app): State<AppState>, Query(p): Query<PageParams>) -> impl IntoResponse {
    let page = p.request(app.scanner.config().default_page_size);
    Json(app.scanner.inventory().history(page).await)
}

async fn get_scan_history(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.scanner.inventory().daily_summary().await)
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: Option<String>,
    port: Option<String>,
    banner: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

async fn get_search(State(app): State<AppState>, Query(p): Query<SearchParams>) -> ApiResult<impl IntoResponse> {
    let query = SearchQuery {
        query: p.query,
        port: parse_port_param(p.port.as_deref())?,
        banner: p.banner,
    };
    let page = PageRequest::new(
        p.page.unwrap_or(1),
        p.per_page.unwrap_or(app.scanner.config().default_page_size),
    );
    Ok(Json(app.scanner.inventory().search(&query, page).await))
}

async fn get_countries() -> impl IntoResponse {
    Json(country::country_list())
}

async fn get_country_ranges(State(app): State<AppState>, UrlPath(code): UrlPath<String>) -> ApiResult<impl IntoResponse> {
    let code = code.trim().to_ascii_uppercase();
    if !country::is_known_country(&code) {
        return Err(ScanError::InvalidConfig(format!("unknown country code: {code}")).into());
    }
    let ranges = app.scanner.resolver().ranges(&code).await?;
    Ok(Json(ranges))
}

/// Ranges arrive either as a list or as newline-delimited text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RangeInput {
    List(Vec<String>),
    Text(String),
}

impl Default for RangeInput {
    fn default() -> Self {
        RangeInput::List(Vec::new())
    }
}

impl RangeInput {
    fn into_lines(self) -> Vec<String> {
        match self {
            RangeInput::List(v) => v,
            RangeInput::Text(t) => t.lines().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PreviewRequest {
    #[serde(default)]
    ranges: RangeInput,
    #[serde(default)]
    exclude_ranges: RangeInput,
}

async fn post_preview(State(app): State<AppState>, ApiJson(req): ApiJson<PreviewRequest>) -> ApiResult<impl IntoResponse> {
    let preview = targets::preview(
        &req.ranges.into_lines(),
        &req.exclude_ranges.into_lines(),
        app.scanner.config(),
    )?;
    Ok(Json(preview))
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    format: Option<String>,
}

async fn get_export(State(app): State<AppState>, Query(p): Query<ExportParams>) -> ApiResult<Response> {
    let format = p.format.as_deref().unwrap_or("csv");
    if !format.eq_ignore_ascii_case("csv") {
        return Err(ScanError::InvalidConfig(format!("unsupported export format: {format}")).into());
    }
    let body = app.scanner.inventory().export_csv().await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=devices.csv"),
        ],
        body,
    )
        .into_response())
}

async fn get_current_user(Extension(user): Extension<CurrentUser>) -> impl IntoResponse {
    Json(user)
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    token: String,
}

async fn post_login(State(app): State<AppState>, ApiJson(req): ApiJson<LoginRequest>) -> ApiResult<Response> {
    match app.users.lookup(&req.token) {
        Some(user) if user.username == req.username => {
            let cookie = auth::session_cookie(&req.token);
            Ok(([(header::SET_COOKIE, cookie)], Json(user)).into_response())
        }
        _ => Err(ScanError::Unauthenticated.into()),
    }
}

async fn post_logout() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, auth::cleared_cookie())],
        Ack::ok("Logged out"),
    )
}
