/// HTTP Server logic
use crate::{
    EmbedRequest, EmbedResponse, EmbedResult, ErrorResponse, ErrorType, Info, Input, InputItem,
    ItemErrorType, Rank, RerankRequest, RerankResponse,
};
use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::routing::{get, post};
use axum::{http, Json, Router};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use clip_embeddings_core::infer::Infer;
use clip_embeddings_core::preprocess::ItemContent;
use clip_embeddings_core::ClipEmbeddingsError;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::instrument;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

///CLIP Embeddings Inference endpoint info
#[utoipa::path(
get,
tag = "CLIP Embeddings Inference",
path = "/info",
responses((status = 200, description = "Served model info", body = Info))
)]
#[instrument]
async fn get_model_info(info: Extension<Info>) -> Json<Info> {
    Json(info.0)
}

#[utoipa::path(
get,
tag = "CLIP Embeddings Inference",
path = "/health",
responses(
(status = 200, description = "Everything is working fine"),
(status = 503, description = "CLIP Embeddings Inference is down", body = ErrorResponse,
example = json ! ({"error": "unhealthy", "error_type": "unhealthy"})),
)
)]
#[instrument(skip(infer))]
/// Health check method
async fn health(infer: Extension<Infer>) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    match infer.health().await {
        true => Ok(()),
        false => Err(ErrorResponse {
            error: "unhealthy".to_string(),
            error_type: ErrorType::Unhealthy,
        })?,
    }
}

fn into_items(
    items: Vec<InputItem>,
    max_client_batch_size: usize,
) -> Result<Vec<ItemContent>, ErrorResponse> {
    let batch_size = items.len();
    if batch_size > max_client_batch_size {
        let message = format!(
            "batch size {batch_size} > maximum allowed batch size {max_client_batch_size}"
        );
        tracing::error!("{message}");
        let counter = metrics::counter!("ce_request_failure", "err" => "batch_size");
        counter.increment(1);
        return Err(ErrorResponse {
            error: message,
            error_type: ErrorType::Validation,
        });
    }

    items
        .into_iter()
        .map(ItemContent::try_from)
        .collect::<Result<Vec<ItemContent>, String>>()
        .map_err(|err| {
            tracing::error!("{err}");
            let counter = metrics::counter!("ce_request_failure", "err" => "validation");
            counter.increment(1);
            ErrorResponse {
                error: err,
                error_type: ErrorType::Validation,
            }
        })
}

/// Get Embeddings. Returns one result per input item, in input order; failed
/// items carry an error marker instead of a vector.
#[utoipa::path(
post,
tag = "CLIP Embeddings Inference",
path = "/embed",
request_body = EmbedRequest,
responses(
(status = 200, description = "Embeddings", body = EmbedResponse),
(status = 429, description = "Model is overloaded", body = ErrorResponse,
example = json ! ({"error": "Model is overloaded", "error_type": "overloaded"})),
(status = 413, description = "Batch size error", body = ErrorResponse,
example = json ! ({"error": "Batch size error", "error_type": "validation"})),
)
)]
#[instrument(skip_all, fields(total_time))]
async fn embed(
    infer: Extension<Infer>,
    info: Extension<Info>,
    Json(req): Json<EmbedRequest>,
) -> Result<(HeaderMap, Json<EmbedResponse>), (StatusCode, Json<ErrorResponse>)> {
    let span = tracing::Span::current();
    let start_time = Instant::now();

    let items = match req.inputs {
        Input::Single(item) => vec![item],
        Input::Batch(items) => items,
    };
    if items.is_empty() {
        let message = "`inputs` cannot be empty".to_string();
        tracing::error!("{message}");
        let counter = metrics::counter!("ce_request_failure", "err" => "validation");
        counter.increment(1);
        let err = ErrorResponse {
            error: message,
            error_type: ErrorType::Validation,
        };
        Err(err)?;
    }

    let counter = metrics::counter!("ce_request_count", "method" => "embed");
    counter.increment(1);

    let items = into_items(items, info.max_client_batch_size)?;

    let permit = infer.try_acquire_permit().map_err(ErrorResponse::from)?;
    let results = infer.embed(items, permit).await;

    let counter = metrics::counter!("ce_request_success", "method" => "embed");
    counter.increment(1);

    let response = EmbedResponse(results.into_iter().map(EmbedResult::from).collect());

    let total_time = start_time.elapsed();
    span.record("total_time", format!("{total_time:?}"));

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-total-time",
        total_time.as_millis().to_string().parse().unwrap(),
    );

    let histogram = metrics::histogram!("ce_request_duration");
    histogram.record(total_time.as_secs_f64());

    tracing::info!("Success");

    Ok((headers, Json(response)))
}

/// Get Ranks. Scores every candidate against the query and returns them
/// ordered by descending score. Returns a 424 status code if the query or any
/// candidate fails to embed.
#[utoipa::path(
post,
tag = "CLIP Embeddings Inference",
path = "/rerank",
request_body = RerankRequest,
responses(
(status = 200, description = "Ranks", body = RerankResponse),
(status = 424, description = "Rerank Error", body = ErrorResponse,
example = json ! ({"error": "Inference failed", "error_type": "rank"})),
(status = 429, description = "Model is overloaded", body = ErrorResponse,
example = json ! ({"error": "Model is overloaded", "error_type": "overloaded"})),
(status = 413, description = "Batch size error", body = ErrorResponse,
example = json ! ({"error": "Batch size error", "error_type": "validation"})),
)
)]
#[instrument(skip_all, fields(total_time))]
async fn rerank(
    infer: Extension<Infer>,
    info: Extension<Info>,
    Json(req): Json<RerankRequest>,
) -> Result<(HeaderMap, Json<RerankResponse>), (StatusCode, Json<ErrorResponse>)> {
    let span = tracing::Span::current();
    let start_time = Instant::now();

    if req.candidates.is_empty() {
        let message = "`candidates` cannot be empty".to_string();
        tracing::error!("{message}");
        let counter = metrics::counter!("ce_request_failure", "err" => "validation");
        counter.increment(1);
        let err = ErrorResponse {
            error: message,
            error_type: ErrorType::Validation,
        };
        Err(err)?;
    }

    let counter = metrics::counter!("ce_request_count", "method" => "rerank");
    counter.increment(1);

    let query =
        ItemContent::try_from(req.query).map_err(|err| {
            tracing::error!("{err}");
            ErrorResponse {
                error: err,
                error_type: ErrorType::Validation,
            }
        })?;
    let candidates = into_items(req.candidates, info.max_client_batch_size)?;

    let permit = infer.try_acquire_permit().map_err(ErrorResponse::from)?;
    let ranks = infer
        .rank(query, candidates, permit)
        .await
        .map_err(ErrorResponse::from)?;

    let counter = metrics::counter!("ce_request_success", "method" => "rerank");
    counter.increment(1);

    let response = RerankResponse(
        ranks
            .into_iter()
            .map(|rank| Rank {
                index: rank.index,
                score: rank.score,
            })
            .collect(),
    );

    let total_time = start_time.elapsed();
    span.record("total_time", format!("{total_time:?}"));

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-total-time",
        total_time.as_millis().to_string().parse().unwrap(),
    );

    let histogram = metrics::histogram!("ce_request_duration");
    histogram.record(total_time.as_secs_f64());

    tracing::info!("Success");

    Ok((headers, Json(response)))
}

/// Serving method
pub async fn run(
    infer: Infer,
    info: Info,
    addr: SocketAddr,
    payload_limit: usize,
    api_key: Option<String>,
    allow_origin: Option<AllowOrigin>,
) -> Result<()> {
    // OpenAPI documentation
    #[derive(OpenApi)]
    #[openapi(
    paths(
    get_model_info,
    health,
    embed,
    rerank,
    ),
    components(
    schemas(
    Info,
    Input,
    InputItem,
    EmbedRequest,
    EmbedResponse,
    EmbedResult,
    ItemErrorType,
    RerankRequest,
    RerankResponse,
    Rank,
    ErrorResponse,
    ErrorType,
    )
    ),
    tags(
    (name = "CLIP Embeddings Inference", description = "CLIP Embeddings Inference API")
    ),
    info(
    title = "CLIP Embeddings Inference",
    license(
    name = "Apache-2.0",
    )
    )
    )]
    struct ApiDoc;

    // CORS layer
    let allow_origin = allow_origin.unwrap_or(AllowOrigin::any());
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([http::header::CONTENT_TYPE])
        .allow_origin(allow_origin);

    // Create router
    let mut app = Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        // Base routes
        .route("/", post(embed))
        .route("/info", get(get_model_info))
        .route("/embed", post(embed))
        .route("/rerank", post(rerank))
        // Base Health route
        .route("/health", get(health))
        .route("/", get(health))
        .layer(Extension(infer))
        .layer(Extension(info))
        .layer(DefaultBodyLimit::max(payload_limit))
        .layer(OtelAxumLayer::default())
        .layer(cors_layer);

    if let Some(api_key) = api_key {
        let mut prefix = "Bearer ".to_string();
        prefix.push_str(&api_key);

        // Leak to allow FnMut
        let api_key: &'static str = prefix.leak();

        let auth = move |headers: HeaderMap,
                         request: axum::extract::Request,
                         next: axum::middleware::Next| async move {
            match headers.get(AUTHORIZATION) {
                Some(token) if token == api_key => {
                    let response = next.run(request).await;
                    Ok(response)
                }
                _ => Err(StatusCode::UNAUTHORIZED),
            }
        };

        app = app.layer(axum::middleware::from_fn(auth));
    }

    // Run server
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Starting HTTP server: {}", &addr);
    tracing::info!("Ready");

    axum::serve(listener, app)
        // Wait until all requests are finished to shut down
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
    opentelemetry::global::shutdown_tracer_provider();
}

impl From<ClipEmbeddingsError> for ErrorResponse {
    fn from(err: ClipEmbeddingsError) -> Self {
        let error_type = match err {
            ClipEmbeddingsError::Validation(_) => ErrorType::Validation,
            ClipEmbeddingsError::Config(_) => ErrorType::Validation,
            ClipEmbeddingsError::Overloaded(_) => ErrorType::Overloaded,
            ClipEmbeddingsError::Backend(_) => ErrorType::Backend,
            ClipEmbeddingsError::Rank(_) => ErrorType::Rank,
        };
        Self {
            error: err.to_string(),
            error_type,
        }
    }
}

impl From<&ErrorType> for StatusCode {
    fn from(value: &ErrorType) -> Self {
        match value {
            ErrorType::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::Backend => StatusCode::FAILED_DEPENDENCY,
            ErrorType::Rank => StatusCode::FAILED_DEPENDENCY,
            ErrorType::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::Validation => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Convert to Axum supported formats
impl From<ErrorResponse> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: ErrorResponse) -> Self {
        (StatusCode::from(&err.error_type), Json(err))
    }
}
