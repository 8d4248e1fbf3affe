/// CLIP Embeddings Inference Webserver
pub mod logging;
mod prometheus;
pub mod server;

use anyhow::{Context, Result};
use base64::prelude::{Engine, BASE64_STANDARD};
use clip_embeddings_backend::{Backend, DType};
use clip_embeddings_core::decode::ClipDecoder;
use clip_embeddings_core::infer::{Infer, ItemEmbedding, RetryPolicy};
use clip_embeddings_core::preprocess::{ItemContent, PreprocessPool};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::AllowOrigin;
use utoipa::ToSchema;

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Info {
    /// Model info
    #[schema(example = "/data/clip-vit-base-patch32")]
    pub model_path: String,
    #[schema(example = "cosine")]
    pub metric: String,
    /// Router Parameters
    #[schema(example = "4")]
    pub pool_size: usize,
    #[schema(example = "64")]
    pub batch_size: usize,
    #[schema(example = "0")]
    pub retry_attempts: usize,
    #[schema(example = "512")]
    pub max_concurrent_requests: usize,
    #[schema(example = "32")]
    pub max_client_batch_size: usize,
    /// Router Info
    #[schema(example = "0.3.1")]
    pub version: &'static str,
}

/// One content item: a plain string is text, objects select a modality
/// explicitly
#[derive(Deserialize, Debug, Clone, ToSchema)]
#[serde(untagged)]
pub(crate) enum InputItem {
    Plain(String),
    Text {
        text: String,
    },
    /// Base64 encoded image bytes
    Image {
        image: String,
    },
}

#[derive(Deserialize, Debug, ToSchema)]
#[serde(untagged)]
pub(crate) enum Input {
    Single(InputItem),
    Batch(Vec<InputItem>),
}

impl TryFrom<InputItem> for ItemContent {
    type Error = String;

    fn try_from(item: InputItem) -> Result<Self, Self::Error> {
        match item {
            InputItem::Plain(text) | InputItem::Text { text } => Ok(ItemContent::Text(text)),
            InputItem::Image { image } => {
                let bytes = BASE64_STANDARD
                    .decode(image)
                    .map_err(|err| format!("invalid base64 image payload: {err}"))?;
                Ok(ItemContent::ImageBytes(bytes))
            }
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct EmbedRequest {
    pub inputs: Input,
}

/// One slot of an embedding response; failed items keep their position
#[derive(Serialize, ToSchema)]
#[serde(untagged)]
pub(crate) enum EmbedResult {
    Embedding { embedding: Vec<f32> },
    Failure { error: String, error_type: ItemErrorType },
}

impl From<ItemEmbedding> for EmbedResult {
    fn from(value: ItemEmbedding) -> Self {
        use clip_embeddings_core::infer::ItemError;
        match value {
            Ok(embedding) => EmbedResult::Embedding { embedding },
            Err(err) => {
                let error_type = match err {
                    ItemError::Decode(_) => ItemErrorType::Decode,
                    ItemError::Inference(_) => ItemErrorType::Inference,
                };
                EmbedResult::Failure {
                    error: err.to_string(),
                    error_type,
                }
            }
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ItemErrorType {
    Decode,
    Inference,
}

#[derive(Serialize, ToSchema)]
pub(crate) struct EmbedResponse(pub Vec<EmbedResult>);

#[derive(Deserialize, ToSchema)]
pub(crate) struct RerankRequest {
    pub query: InputItem,
    pub candidates: Vec<InputItem>,
}

#[derive(Serialize, ToSchema)]
pub(crate) struct Rank {
    #[schema(example = "0")]
    pub index: usize,
    #[schema(example = "1.0")]
    pub score: f32,
}

#[derive(Serialize, ToSchema)]
pub(crate) struct RerankResponse(pub Vec<Rank>);

#[derive(Serialize, ToSchema)]
pub(crate) enum ErrorType {
    Unhealthy,
    Backend,
    Overloaded,
    Validation,
    Rank,
}

#[derive(Serialize, ToSchema)]
pub(crate) struct ErrorResponse {
    pub error: String,
    pub error_type: ErrorType,
}

/// Build the shared serving resources and run the HTTP server until shutdown
#[allow(clippy::too_many_arguments)]
pub async fn run(
    model_path: PathBuf,
    dtype: Option<DType>,
    pool_size: usize,
    batch_size: usize,
    retry_attempts: usize,
    max_concurrent_requests: usize,
    max_client_batch_size: usize,
    image_size: usize,
    context_length: usize,
    hostname: Option<String>,
    port: u16,
    payload_limit: usize,
    api_key: Option<String>,
    prometheus_port: u16,
    cors_allow_origin: Option<Vec<String>>,
) -> Result<()> {
    let dtype = dtype.unwrap_or_default();

    // Content decoding for the preprocessing workers
    let tokenizer_path = model_path.join("tokenizer.json");
    let decoder = ClipDecoder::from_file(&tokenizer_path, image_size, context_length)
        .context("Could not load content decoder")?;

    // Shared, long-lived resources: constructed once, passed by reference
    let pool = PreprocessPool::new(pool_size, Arc::new(decoder))
        .context("Could not start preprocessing pool")?;

    tracing::info!("Starting model backend");
    let backend = Backend::new(model_path.clone(), dtype).context("Could not start backend")?;

    let retry_policy = match retry_attempts {
        0 => RetryPolicy::None,
        n => RetryPolicy::Fixed(n),
    };

    let infer = Infer::new(
        pool,
        backend,
        batch_size,
        retry_policy,
        max_concurrent_requests,
    )
    .context("Could not create inference pipeline")?;

    // Wait for the backend to pass its first health check
    infer
        .health()
        .await
        .then_some(())
        .ok_or_else(|| anyhow::anyhow!("Backend is not healthy"))?;
    tracing::info!("Backend is healthy");

    let info = Info {
        model_path: model_path.display().to_string(),
        metric: infer.metric().to_string(),
        pool_size,
        batch_size: infer.batch_size(),
        retry_attempts,
        max_concurrent_requests,
        max_client_batch_size,
        version: env!("CARGO_PKG_VERSION"),
    };

    let addr = match hostname.as_deref().map(|h| h.parse::<IpAddr>()) {
        Some(Ok(ip)) => SocketAddr::new(ip, port),
        _ => {
            tracing::warn!("Invalid hostname, defaulting to 0.0.0.0");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port)
        }
    };

    // Prometheus recorder with its own listener
    let mut prometheus_addr = addr;
    prometheus_addr.set_port(prometheus_port);
    prometheus::builder(prometheus_addr)
        .context("Could not build prometheus recorder")?
        .install()
        .context("Could not install prometheus recorder")?;
    tracing::info!("Serving Prometheus metrics: {prometheus_addr}");

    let allow_origin = cors_allow_origin.map(|allow_origin| {
        AllowOrigin::list(
            allow_origin
                .iter()
                .map(|origin| origin.parse().expect("Invalid CORS origin")),
        )
    });

    server::run(
        infer,
        info,
        addr,
        payload_limit,
        api_key,
        allow_origin,
    )
    .await
}

pub use logging::init_logging;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_item_deserialization() {
        let plain: InputItem = serde_json::from_str(r#""a photo of a cat""#).unwrap();
        assert!(matches!(plain, InputItem::Plain(_)));

        let text: InputItem = serde_json::from_str(r#"{"text": "a photo of a cat"}"#).unwrap();
        assert!(matches!(text, InputItem::Text { .. }));

        let image: InputItem = serde_json::from_str(r#"{"image": "aGVsbG8="}"#).unwrap();
        assert!(matches!(image, InputItem::Image { .. }));
    }

    #[test]
    fn test_input_item_conversion() {
        let content = ItemContent::try_from(InputItem::Image {
            image: BASE64_STANDARD.encode([1_u8, 2, 3]),
        })
        .unwrap();
        match content {
            ItemContent::ImageBytes(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("unexpected content: {other:?}"),
        }

        let err = ItemContent::try_from(InputItem::Image {
            image: "not base64!!".to_string(),
        })
        .unwrap_err();
        assert!(err.contains("base64"));
    }

    #[test]
    fn test_embed_result_serialization() {
        use clip_embeddings_core::infer::ItemError;

        let ok = EmbedResult::from(Ok(vec![0.0, 1.0]));
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"embedding":[0.0,1.0]}"#
        );

        let err = EmbedResult::from(Err(ItemError::Decode("bad image".to_string())));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error_type"], "decode");
    }
}
