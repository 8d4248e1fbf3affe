pub mod decode;
pub mod infer;
pub mod preprocess;
pub mod rank;

use clip_embeddings_backend::BackendError;
use thiserror::Error;
use tokio::sync::TryAcquireError;

#[derive(Error, Debug)]
pub enum ClipEmbeddingsError {
    #[error("Input validation error: {0}")]
    Validation(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Model is overloaded")]
    Overloaded(#[from] TryAcquireError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Rank error: {0}")]
    Rank(#[from] rank::RankError),
}
