use crate::preprocess::{ItemContent, PreprocessPool};
use crate::rank::{rank_candidates, Rank, RankError};
use crate::ClipEmbeddingsError;
use clip_embeddings_backend::{Backend, Batch, SimilarityMetric, Tensor};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::instrument;

/// Per-item failure marker.
///
/// A failed item keeps its slot in the response so callers can line results
/// up with their inputs.
#[derive(Debug, Error, Clone)]
pub enum ItemError {
    #[error("decoding failed: {0}")]
    Decode(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// One slot of an embedding response
pub type ItemEmbedding = Result<Vec<f32>, ItemError>;

/// Retry strategy applied when a batch fails inference
#[derive(Debug, Clone, Copy)]
pub enum RetryPolicy {
    None,
    /// Re-dispatch a failed batch up to this many extra times
    Fixed(usize),
}

impl RetryPolicy {
    fn extra_attempts(&self) -> usize {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed(n) => *n,
        }
    }
}

/// Inference struct
#[derive(Debug, Clone)]
pub struct Infer {
    pool: PreprocessPool,
    backend: Backend,
    batch_size: usize,
    retry_policy: RetryPolicy,
    /// Inference limit
    limit_concurrent_requests: Arc<Semaphore>,
}

impl Infer {
    pub fn new(
        pool: PreprocessPool,
        backend: Backend,
        batch_size: usize,
        retry_policy: RetryPolicy,
        max_concurrent_requests: usize,
    ) -> Result<Self, ClipEmbeddingsError> {
        if batch_size == 0 {
            return Err(ClipEmbeddingsError::Config(
                "`batch_size` must be > 0".to_string(),
            ));
        }

        // Never hand the engine more members than it advertises accepting
        let batch_size = match backend.max_batch_size {
            Some(max) => batch_size.min(max),
            None => batch_size,
        };

        // Inference limit with a semaphore
        let semaphore = Arc::new(Semaphore::new(max_concurrent_requests));

        Ok(Self {
            pool,
            backend,
            batch_size,
            retry_policy,
            limit_concurrent_requests: semaphore,
        })
    }

    #[instrument(skip(self))]
    pub fn try_acquire_permit(&self) -> Result<OwnedSemaphorePermit, ClipEmbeddingsError> {
        // Limit concurrent requests by acquiring a permit from the semaphore
        self.clone()
            .limit_concurrent_requests
            .try_acquire_owned()
            .map_err(|err| {
                let counter = metrics::counter!("ce_request_failure", "err" => "overloaded");
                counter.increment(1);
                tracing::error!("{err}");
                ClipEmbeddingsError::from(err)
            })
    }

    #[instrument(skip(self))]
    pub async fn acquire_permit(&self) -> OwnedSemaphorePermit {
        // Limit concurrent requests by acquiring a permit from the semaphore
        self.clone()
            .limit_concurrent_requests
            .acquire_owned()
            .await
            .expect("Semaphore has been closed. This is a bug.")
    }

    /// Embed a request, one result per item in input order.
    ///
    /// Item and batch failures surface as markers in their slots; they never
    /// abort the rest of the request.
    #[instrument(skip_all)]
    pub async fn embed(
        &self,
        items: Vec<ItemContent>,
        _permit: OwnedSemaphorePermit,
    ) -> Vec<ItemEmbedding> {
        let start_time = Instant::now();
        let counter = metrics::counter!("ce_embed_count");
        counter.increment(1);

        let results = self.embed_pipelined(items).await;

        let counter = metrics::counter!("ce_embed_success");
        counter.increment(1);
        let histogram = metrics::histogram!("ce_embed_duration");
        histogram.record(start_time.elapsed().as_secs_f64());

        results
    }

    /// Rank candidates against a query by embedding similarity.
    ///
    /// Query and candidates ride the same batched pipeline as a plain
    /// embedding request; only scoring and ordering are rerank-specific.
    #[instrument(skip_all)]
    pub async fn rank(
        &self,
        query: ItemContent,
        candidates: Vec<ItemContent>,
        permit: OwnedSemaphorePermit,
    ) -> Result<Vec<Rank>, ClipEmbeddingsError> {
        let start_time = Instant::now();
        let counter = metrics::counter!("ce_rank_count");
        counter.increment(1);

        let num_candidates = candidates.len();

        // One request: query first, candidates after, original order
        let mut items = Vec::with_capacity(num_candidates + 1);
        items.push(query);
        items.extend(candidates);

        let mut results = self.embed(items, permit).await;

        let candidate_results = results.split_off(1);
        let query_embedding = results
            .pop()
            .expect("query result missing from pipeline output. This is a bug.")
            .map_err(|err| RankError::Query(err.to_string()))?;

        let ranks = rank_candidates(self.backend.metric, query_embedding, candidate_results)
            .await
            .map_err(|err| {
                let counter = metrics::counter!("ce_request_failure", "err" => "rank");
                counter.increment(1);
                tracing::error!("{err}");
                err
            })?;

        let counter = metrics::counter!("ce_rank_success");
        counter.increment(1);
        let histogram = metrics::histogram!("ce_rank_duration");
        histogram.record(start_time.elapsed().as_secs_f64());

        Ok(ranks)
    }

    /// Split the request into batches and run the two pipeline stages.
    ///
    /// The stages are joined by a single-slot channel: preprocessing runs at
    /// most one batch ahead of the engine, so buffering stays bounded no
    /// matter how long the request is.
    async fn embed_pipelined(&self, items: Vec<ItemContent>) -> Vec<ItemEmbedding> {
        let num_items = items.len();
        if num_items == 0 {
            // Nothing to do; the pool and the backend are never touched
            return Vec::new();
        }

        // Consecutive batches, original indices preserved by position
        let mut batches = Vec::with_capacity(num_items.div_ceil(self.batch_size));
        let mut current = Vec::with_capacity(self.batch_size.min(num_items));
        for item in items {
            current.push(item);
            if current.len() == self.batch_size {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }

        // Bound channel to 1 to prefetch a single batch ahead of the engine
        let (batch_sender, mut batch_receiver) = mpsc::channel(1);

        let preprocess_task = async move {
            for (batch_id, batch_items) in batches.into_iter().enumerate() {
                let tensors = self.pool.preprocess(batch_items).await;
                if batch_sender.send((batch_id, tensors)).await.is_err() {
                    // Inference side hung up; stop admitting batches
                    break;
                }
            }
        };

        let infer_task = async {
            let mut outputs: Vec<Option<ItemEmbedding>> = (0..num_items).map(|_| None).collect();
            while let Some((batch_id, tensors)) = batch_receiver.recv().await {
                let base = batch_id * self.batch_size;
                self.infer_batch(batch_id, base, tensors, &mut outputs).await;
            }
            outputs
        };

        let ((), outputs) = tokio::join!(preprocess_task, infer_task);

        outputs
            .into_iter()
            .map(|slot| slot.expect("pipeline left an output slot empty. This is a bug."))
            .collect()
    }

    /// Run one preprocessed batch through the backend and scatter the
    /// embeddings to their original indices
    async fn infer_batch(
        &self,
        batch_id: usize,
        base: usize,
        tensors: Vec<Result<Tensor, String>>,
        outputs: &mut [Option<ItemEmbedding>],
    ) {
        let mut batch = Batch::default();
        batch.cumulative_seq_lengths.push(0);

        // Original index of each batch member, in member order
        let mut slots = Vec::with_capacity(tensors.len());

        for (offset, tensor) in tensors.into_iter().enumerate() {
            let index = base + offset;
            match tensor {
                Ok(Tensor::Pixels { data, shape }) => {
                    batch.pixel_shape = shape;
                    batch.image_indices.push(slots.len() as u32);
                    batch.pixel_values.extend(data);
                    slots.push(index);
                }
                Ok(Tensor::TokenIds(input_ids)) => {
                    let seq_length = input_ids.len() as u32;
                    batch.max_length = batch.max_length.max(seq_length);
                    batch.text_indices.push(slots.len() as u32);
                    let cumulative = batch
                        .cumulative_seq_lengths
                        .last()
                        .copied()
                        .expect("cumulative_seq_lengths is never empty")
                        + seq_length;
                    batch.cumulative_seq_lengths.push(cumulative);
                    batch.input_ids.extend(input_ids);
                    slots.push(index);
                }
                Err(err) => {
                    outputs[index] = Some(Err(ItemError::Decode(err)));
                }
            }
        }

        if batch.is_empty() {
            return;
        }

        let histogram = metrics::histogram!("ce_batch_size");
        histogram.record(batch.len() as f64);

        let extra_attempts = self.retry_policy.extra_attempts();
        let mut attempt = 0;
        let err = loop {
            // Keep a copy only while a retry is still possible
            let payload = if attempt < extra_attempts {
                batch.clone()
            } else {
                std::mem::take(&mut batch)
            };
            match self.backend.embed(payload).await {
                Ok((mut embeddings, inference_duration)) => {
                    let histogram = metrics::histogram!("ce_inference_duration");
                    histogram.record(inference_duration.as_secs_f64());

                    for (member, index) in slots.iter().enumerate() {
                        let embedding = embeddings
                            .remove(&member)
                            .expect("embedding not found in results. This is a backend bug.");
                        outputs[*index] = Some(Ok(embedding));
                    }
                    return;
                }
                Err(err) if attempt < extra_attempts => {
                    attempt += 1;
                    tracing::warn!(
                        "Retrying batch {batch_id} after inference failure ({attempt}/{extra_attempts}): {err}"
                    );
                }
                Err(err) => break err,
            }
        };

        // Batch-fatal, not request-fatal: mark this batch's members and let
        // the other batches carry on
        let counter = metrics::counter!("ce_request_failure", "err" => "inference");
        counter.increment(1);
        tracing::error!("Inference failed for batch {batch_id}: {err}");
        for index in slots {
            outputs[index] = Some(Err(ItemError::Inference(err.to_string())));
        }
    }

    pub fn metric(&self) -> SimilarityMetric {
        self.backend.metric
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> bool {
        self.backend.health().await.is_ok()
    }

    #[instrument(skip(self))]
    pub fn health_watcher(&self) -> watch::Receiver<bool> {
        self.backend.health_watcher()
    }
}
