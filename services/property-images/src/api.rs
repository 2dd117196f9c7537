use crate::auth::{AuthenticatedUser, SessionResolver};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::orchestrator::{ImageDescriptor, ImageSource, PropertyImageService, UploadOutcome};
use crate::provider_client::ProviderImage;
use crate::rate_limit::{client_key, RateLimiter};
use crate::validation::{parse_image_order, UploadValidator, ValidationError};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Extension, Json, Router,
};
use serde::Serialize;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub images: Arc<PropertyImageService>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub sessions: Arc<dyn SessionResolver>,
    pub validator: UploadValidator,
    /// Max age advertised on image listings
    pub cache_max_age_secs: u64,
    /// Pool pinged by the readiness check
    pub pool: Option<PgPool>,
}

/// Image listing response
#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub success: bool,
    pub data: Vec<ImageDescriptor>,
    pub count: usize,
    pub source: ImageSource,
}

/// Image upload response
#[derive(Debug, Serialize)]
pub struct ImageUploadResponse {
    pub success: bool,
    pub data: UploadOutcome,
    pub source: ImageSource,
}

/// Image reorder response
#[derive(Debug, Serialize)]
pub struct ImageOrderResponse {
    pub success: bool,
    pub data: Vec<ProviderImage>,
    pub count: usize,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    // Layers run outermost first: rate limit, then authentication
    let images = Router::new()
        .route(
            "/api/buildium/properties/:property_id/images",
            get(list_images).post(upload_image),
        )
        .route(
            "/api/buildium/properties/:property_id/images/order",
            put(reorder_images),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), enforce_rate_limit))
        .layer(DefaultBodyLimit::max(state.validator.max_body_bytes()));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .merge(images)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = client_key(request.headers());
    let decision = state.rate_limiter.check(&key);
    if !decision.success {
        warn!(client = %key, retry_after = decision.retry_after, "Rate limit exceeded");
        metrics::counter!("property_images.rate_limited").increment(1);
        return Err(ApiError::RateLimited {
            retry_after: decision.retry_after,
        });
    }
    Ok(next.run(request).await)
}

async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = state
        .sessions
        .resolve(request.headers())
        .await
        .ok_or(ApiError::Unauthenticated)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "property-images-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(pool) = &state.pool else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "not_configured"
            })),
        );
    };

    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// List a property's images from the first backend that has any
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let images = state.images.list_images(&property_id).await?;

    let cache_control = format!("private, max-age={}", state.cache_max_age_secs);
    Ok((
        [(header::CACHE_CONTROL, cache_control)],
        Json(ImageListResponse {
            success: true,
            count: images.data.len(),
            data: images.data,
            source: images.source,
        }),
    ))
}

/// Upload an image, to the provider when possible
#[instrument(skip(state, user, body), fields(user_id = %user.id))]
async fn upload_image(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Bytes, BytesRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let body = read_body(body, state.validator.max_file_bytes())?;
    let upload = state.validator.parse(&body)?;
    let uploaded = state.images.upload_image(&property_id, upload).await?;

    info!(source = uploaded.source.as_str(), "Image upload accepted");

    Ok((
        StatusCode::CREATED,
        Json(ImageUploadResponse {
            success: true,
            data: uploaded.data,
            source: uploaded.source,
        }),
    ))
}

/// Reorder a property's images at the provider
#[instrument(skip(state, body))]
async fn reorder_images(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ImageOrderResponse>, ApiError> {
    let body = read_body(body, state.validator.max_file_bytes())?;
    let order = parse_image_order(&body)?;
    let images = state.images.reorder_images(&property_id, order).await?;

    Ok(Json(ImageOrderResponse {
        success: true,
        count: images.len(),
        data: images,
    }))
}

/// Bodies over the length limit answer like any other oversized file
fn read_body(
    body: Result<Bytes, BytesRejection>,
    max_file_bytes: usize,
) -> Result<Bytes, ValidationError> {
    match body {
        Ok(body) => Ok(body),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            warn!("Request body exceeded the length limit");
            Err(ValidationError::FileTooLarge(max_file_bytes))
        }
        Err(rejection) => Err(ValidationError::MalformedBody(rejection.body_text())),
    }
}

/// Start the HTTP API server, draining connections once `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting property images API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MockSessionResolver, StaticTokenResolver};
    use crate::config::{ApiToken, AuthConfig, UploadConfig};
    use crate::metadata_store::MockImageMetadataStore;
    use crate::object_storage::MockObjectStorage;
    use crate::provider_client::MockProviderImageService;
    use crate::rate_limit::{MockRateLimiter, RateLimitDecision};
    use crate::resolver::{IdentifierResolver, MockPropertyDirectory};
    use crate::test_support::*;
    use axum::body::Body;
    use axum::http::Method;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const PROPERTY_ID: &str = "5d0c1c2e-8a4f-4a6b-9e53-0d2f1f3c7b11";
    const TOKEN: &str = "test-token";

    fn allow_all() -> MockRateLimiter {
        let mut limiter = MockRateLimiter::new();
        limiter.expect_check().returning(|_| RateLimitDecision {
            success: true,
            retry_after: 0,
        });
        limiter
    }

    fn token_sessions() -> StaticTokenResolver {
        StaticTokenResolver::new(&AuthConfig {
            tokens: vec![ApiToken {
                token: TOKEN.to_string(),
                user_id: "user-1".to_string(),
            }],
        })
    }

    fn router(
        images: PropertyImageService,
        rate_limiter: impl RateLimiter + 'static,
        sessions: impl SessionResolver + 'static,
    ) -> Router {
        router_with(images, rate_limiter, sessions, UploadConfig::default())
    }

    fn router_with(
        images: PropertyImageService,
        rate_limiter: impl RateLimiter + 'static,
        sessions: impl SessionResolver + 'static,
        upload: UploadConfig,
    ) -> Router {
        let state = AppState {
            images: Arc::new(images),
            rate_limiter: Arc::new(rate_limiter),
            sessions: Arc::new(sessions),
            validator: UploadValidator::new(upload),
            cache_max_age_secs: 300,
            pool: None,
        };
        create_router(state, &ApiConfig::default())
    }

    /// Service whose backends panic if touched
    fn untouchable_service() -> PropertyImageService {
        PropertyImageService::new(
            IdentifierResolver::new(Arc::new(MockPropertyDirectory::new())),
            Arc::new(MockProviderImageService::new()),
            Arc::new(MockImageMetadataStore::new()),
            Some(Arc::new(MockObjectStorage::new())),
        )
    }

    fn in_memory_service(
        metadata: Arc<InMemoryMetadataStore>,
        storage: Arc<InMemoryObjectStorage>,
    ) -> PropertyImageService {
        PropertyImageService::new(
            IdentifierResolver::new(Arc::new(InMemoryDirectory::default())),
            Arc::new(FakeProvider::default()),
            metadata,
            Some(storage),
        )
    }

    fn request(method: Method, uri: &str, body: Body) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn images_uri() -> String {
        format!("/api/buildium/properties/{PROPERTY_ID}/images")
    }

    #[tokio::test]
    async fn test_rate_limited_request_touches_nothing() {
        let upload = serde_json::json!({ "FileName": "a.jpg", "FileData": STANDARD.encode(b"x") });
        let order = serde_json::json!({ "ImageIds": [2, 1] });
        let cases = [
            (Method::GET, images_uri(), Body::empty()),
            (Method::POST, images_uri(), Body::from(upload.to_string())),
            (Method::PUT, format!("{}/order", images_uri()), Body::from(order.to_string())),
        ];

        for (method, uri, body) in cases {
            let mut limiter = MockRateLimiter::new();
            limiter.expect_check().times(1).returning(|_| RateLimitDecision {
                success: false,
                retry_after: 42,
            });
            let app = router(untouchable_service(), limiter, MockSessionResolver::new());

            let response = app
                .oneshot(request(method.clone(), &uri, body))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS, "{method} {uri}");
            assert_eq!(response.headers()[header::RETRY_AFTER], "42");
            let json = json_body(response).await;
            assert_eq!(json["code"], "RATE_LIMITED");
            assert_eq!(json["retryAfter"], 42);
        }
    }

    #[tokio::test]
    async fn test_oversized_body_is_a_validation_error() {
        let metadata = Arc::new(InMemoryMetadataStore::default());
        let storage = Arc::new(InMemoryObjectStorage::default());
        let limits = UploadConfig {
            max_file_bytes: 1024,
            ..UploadConfig::default()
        };
        let app = router_with(
            in_memory_service(metadata.clone(), storage.clone()),
            allow_all(),
            token_sessions(),
            limits,
        );

        for size in [2048, 200_000] {
            let body = serde_json::json!({
                "FileName": "huge.jpg",
                "FileData": STANDARD.encode(vec![0u8; size])
            });

            let response = app
                .clone()
                .oneshot(request(Method::POST, &images_uri(), Body::from(body.to_string())))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{size} bytes");
            let json = json_body(response).await;
            assert_eq!(json["code"], "VALIDATION_ERROR");
            assert_eq!(json["error"], "File exceeds the 1024 byte limit");
        }
        assert!(metadata.rows_for(PROPERTY_ID).is_empty());
        assert!(storage.keys_for(PROPERTY_ID).is_empty());
    }

    #[tokio::test]
    async fn test_missing_session_is_unauthorized() {
        let mut sessions = MockSessionResolver::new();
        sessions.expect_resolve().times(1).returning(|_| None);

        let app = router(untouchable_service(), allow_all(), sessions);

        let response = app
            .oneshot(request(Method::GET, &images_uri(), Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_invalid_upload_is_rejected_before_storage() {
        let metadata = Arc::new(InMemoryMetadataStore::default());
        let storage = Arc::new(InMemoryObjectStorage::default());
        let app = router(
            in_memory_service(metadata.clone(), storage.clone()),
            allow_all(),
            token_sessions(),
        );
        let body = serde_json::json!({ "FileName": "a.jpg", "FileData": "%%% not base64" });

        let response = app
            .oneshot(request(Method::POST, &images_uri(), Body::from(body.to_string())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "VALIDATION_ERROR");
        assert!(metadata.rows_for(PROPERTY_ID).is_empty());
        assert!(storage.keys_for(PROPERTY_ID).is_empty());
    }

    #[tokio::test]
    async fn test_upload_then_list() {
        let metadata = Arc::new(InMemoryMetadataStore::default());
        let storage = Arc::new(InMemoryObjectStorage::default());
        let app = router(
            in_memory_service(metadata.clone(), storage.clone()),
            allow_all(),
            token_sessions(),
        );
        let body = serde_json::json!({
            "FileName": "front.png",
            "FileData": STANDARD.encode(b"png-bytes"),
            "Description": "Front of house"
        });

        let response = app
            .clone()
            .oneshot(request(Method::POST, &images_uri(), Body::from(body.to_string())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["success"], true);
        assert_eq!(created["source"], "object_storage");
        assert_eq!(created["data"]["storage"], "object_storage");
        let url = created["data"]["url"].as_str().unwrap().to_string();
        assert_eq!(storage.read_url(&url).as_deref(), Some(&b"png-bytes"[..]));

        let response = app
            .oneshot(request(Method::GET, &images_uri(), Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "private, max-age=300"
        );
        let listed = json_body(response).await;
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["source"], "object_storage");
        assert_eq!(listed["data"][0]["Href"], url.as_str());
    }

    #[tokio::test]
    async fn test_empty_listing_succeeds() {
        let app = router(
            in_memory_service(Default::default(), Default::default()),
            allow_all(),
            token_sessions(),
        );

        let response = app
            .oneshot(request(Method::GET, &images_uri(), Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["count"], 0);
        assert_eq!(json["source"], "none");
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_reorder_of_unmapped_property_is_bad_request() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        storage.seed(PROPERTY_ID, "1-abcdefgh.jpg", 1);
        let app = router(
            in_memory_service(Default::default(), storage.clone()),
            allow_all(),
            token_sessions(),
        );

        let response = app
            .oneshot(request(
                Method::PUT,
                &format!("{}/order", images_uri()),
                Body::from(r#"{"ImageIds":[2,1]}"#),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "UNMAPPED_PROPERTY");
        assert_eq!(storage.keys_for(PROPERTY_ID).len(), 1);
    }

    #[tokio::test]
    async fn test_reorder_returns_provider_images() {
        let mut provider = MockProviderImageService::new();
        provider
            .expect_reorder_images()
            .times(1)
            .returning(|_, order| {
                Ok(order
                    .image_ids
                    .iter()
                    .map(|id| provider_image(*id, &format!("https://provider.test/{id}.jpg")))
                    .collect())
            });
        let service = PropertyImageService::new(
            IdentifierResolver::new(Arc::new(MockPropertyDirectory::new())),
            Arc::new(provider),
            Arc::new(MockImageMetadataStore::new()),
            None,
        );
        let app = router(service, allow_all(), token_sessions());

        let response = app
            .oneshot(request(
                Method::PUT,
                "/api/buildium/properties/77/images/order",
                Body::from(r#"{"ImageIds":[5,4]}"#),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["count"], 2);
        assert_eq!(json["data"][0]["Id"], 5);
    }

    #[tokio::test]
    async fn test_health_needs_no_session() {
        let app = router(
            untouchable_service(),
            MockRateLimiter::new(),
            MockSessionResolver::new(),
        );

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
