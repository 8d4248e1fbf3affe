#[cfg(feature = "clap")]
use clap::ValueEnum;
use nohash_hasher::IntMap;
use std::fmt;
use thiserror::Error;

/// A single model-ready input produced by preprocessing.
///
/// Pixel tensors share one fixed shape per model; preprocessing is responsible
/// for resizing and normalizing before a tensor reaches a batch.
#[derive(Debug, Clone)]
pub enum Tensor {
    /// Normalized image pixels, flattened in CHW order
    Pixels { data: Vec<f32>, shape: [usize; 3] },
    /// Tokenized text, padded/truncated to the model context length
    TokenIds(Vec<u32>),
}

/// A batch of preprocessed tensors, laid out for a dual-encoder model.
///
/// Image members are flattened into `pixel_values` and addressed by
/// `image_indices`; text members are flattened into `input_ids` and addressed
/// by `text_indices` with `cumulative_seq_lengths` marking row boundaries.
/// Indices are batch-local: `0..len()`.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub pixel_values: Vec<f32>,
    pub pixel_shape: [usize; 3],
    pub image_indices: Vec<u32>,
    pub input_ids: Vec<u32>,
    pub cumulative_seq_lengths: Vec<u32>,
    pub max_length: u32,
    pub text_indices: Vec<u32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.image_indices.len() + self.text_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Embeddings keyed by batch-local index
pub type Embeddings = IntMap<usize, Vec<f32>>;

/// The native distance metric of the embedding space served by a backend.
///
/// Rerank scoring converts any metric into a score where higher means more
/// similar.
#[derive(Debug, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum SimilarityMetric {
    /// Cosine of the angle between embeddings
    Cosine,
    /// Raw dot product; assumes the model emits normalized embeddings
    InnerProduct,
    /// L2 distance; converted to a score by negation
    Euclidean,
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SimilarityMetric::Cosine => write!(f, "cosine"),
            SimilarityMetric::InnerProduct => write!(f, "inner_product"),
            SimilarityMetric::Euclidean => write!(f, "euclidean"),
        }
    }
}

pub trait Backend {
    fn health(&self) -> Result<(), BackendError>;

    /// Largest batch the engine accepts in one call, if bounded
    fn max_batch_size(&self) -> Option<usize> {
        None
    }

    fn metric(&self) -> SimilarityMetric {
        SimilarityMetric::Cosine
    }

    /// Embed every member of the batch.
    ///
    /// Must return exactly one embedding per batch member, keyed by the
    /// member's batch-local index.
    fn embed(&self, batch: Batch) -> Result<Embeddings, BackendError>;
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("No backend found")]
    NoBackend,
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Backend is unhealthy")]
    Unhealthy,
}
