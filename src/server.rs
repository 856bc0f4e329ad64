//! HTTP surface: health, prediction and label listing over a shared
//! [`ServiceContext`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::inference::{Classifier, PredictionResult, DEFAULT_TOP_K};
use crate::labels::{FitzpatrickScale, LabelEntry};

const FALLBACK_INDEX: &str = r#"<html>
    <head><title>Fitzpatrick17k API</title></head>
    <body>
        <h1>Fitzpatrick17k Dermatology Classification API</h1>
        <p>The API is running. POST an image to <code>/predict</code>.</p>
    </body>
</html>
"#;

/// Process-wide state handed to every handler.
///
/// The classifier is installed once, before the listener accepts traffic;
/// until then prediction and label requests are answered with 503.
#[derive(Debug)]
pub struct ServiceContext {
    classifier: OnceLock<Arc<Classifier>>,
    static_dir: Option<PathBuf>,
    default_top_k: usize,
    max_upload_bytes: usize,
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self {
            classifier: OnceLock::new(),
            static_dir: None,
            default_top_k: DEFAULT_TOP_K,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

impl ServiceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    pub fn with_default_top_k(mut self, top_k: usize) -> Self {
        self.default_top_k = top_k;
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    /// Makes the classifier visible to handlers. Only the first call wins.
    pub fn install(&self, classifier: Classifier) -> anyhow::Result<()> {
        self.classifier
            .set(Arc::new(classifier))
            .map_err(|_| anyhow::anyhow!("a classifier is already installed"))
    }

    pub fn classifier(&self) -> Option<&Arc<Classifier>> {
        self.classifier.get()
    }
}

/// Error body shaped as `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        let detail = msg.into();
        warn!("Bad request: {}", detail);
        Self {
            status: StatusCode::BAD_REQUEST,
            detail,
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        let detail = msg.into();
        warn!("Service unavailable: {}", detail);
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            detail,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        let detail = msg.into();
        error!("Internal error: {}", detail);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail,
        }
    }

    /// Keeps the status an extractor chose, e.g. 413 for an oversized upload.
    pub fn rejected(status: StatusCode, msg: impl Into<String>) -> Self {
        let detail = msg.into();
        warn!("Rejected request ({}): {}", status, detail);
        Self { status, detail }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            detail: &self.detail,
        });
        (self.status, body).into_response()
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::rejected(err.status(), format!("Malformed upload: {}", err.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::rejected(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::rejected(rejection.status(), rejection.body_text())
    }
}

pub fn router(context: Arc<ServiceContext>) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/api/labels", get(labels));

    if let Some(dir) = context.static_dir.as_ref().filter(|dir| dir.is_dir()) {
        router = router.nest_service("/static", ServeDir::new(dir));
    }

    router
        .layer(DefaultBodyLimit::max(context.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

async fn index(State(context): State<Arc<ServiceContext>>) -> Html<String> {
    if let Some(dir) = &context.static_dir {
        let path = dir.join("index.html");
        match tokio::fs::read_to_string(&path).await {
            Ok(page) => return Html(page),
            Err(err) => debug!("{} not served: {err}", path.display()),
        }
    }
    Html(FALLBACK_INDEX.to_string())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub device: Option<String>,
}

async fn health(State(context): State<Arc<ServiceContext>>) -> Json<HealthResponse> {
    let classifier = context.classifier();
    Json(HealthResponse {
        status: "healthy".to_string(),
        model_loaded: classifier.is_some(),
        device: classifier.map(|classifier| classifier.device().to_string()),
    })
}

#[derive(Debug, Deserialize)]
pub struct PredictParams {
    pub top_k: Option<usize>,
}

struct Upload {
    content_type: Option<String>,
    bytes: Vec<u8>,
}

async fn read_upload(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?.to_vec();
        return Ok(Upload {
            content_type,
            bytes,
        });
    }
    Err(ApiError::bad_request("Missing multipart field `file`"))
}

// Extractor rejections are resolved after the readiness check.
async fn predict(
    State(context): State<Arc<ServiceContext>>,
    params: Result<Query<PredictParams>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResult>, ApiError> {
    let classifier = context
        .classifier()
        .cloned()
        .ok_or_else(|| ApiError::unavailable("Model not loaded"))?;
    let Query(params) = params?;
    let mut multipart = multipart?;

    let upload = read_upload(&mut multipart).await?;
    let is_image = upload
        .content_type
        .as_deref()
        .is_some_and(|content_type| content_type.starts_with("image/"));
    if !is_image {
        return Err(ApiError::bad_request("Please upload a valid image file"));
    }

    let top_k = params.top_k.unwrap_or(context.default_top_k);
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<PredictionResult> {
        let image = image::load_from_memory(&upload.bytes)?;
        classifier.predict(&image, top_k)
    })
    .await
    .map_err(|err| ApiError::internal(format!("Prediction task failed: {err}")))?
    .map_err(|err| ApiError::internal(format!("Prediction failed: {err}")))?;

    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct LabelsResponse<'a> {
    pub labels: Vec<LabelEntry<'a>>,
    pub fitzpatrick_scales: BTreeMap<i8, &'static str>,
}

async fn labels(State(context): State<Arc<ServiceContext>>) -> Result<Response, ApiError> {
    let classifier = context
        .classifier()
        .ok_or_else(|| ApiError::unavailable("Label mapping not loaded"))?;
    let body = LabelsResponse {
        labels: classifier.labels().entries().collect(),
        fitzpatrick_scales: FitzpatrickScale::published_table(),
    };
    Ok(Json(body).into_response())
}
