/// Raw content preprocessing logic
use crate::ClipEmbeddingsError;
use clip_embeddings_backend::Tensor;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{instrument, Span};

/// One unit of client-submitted content.
///
/// Identity is positional: an item is addressed by its index in the request
/// it arrived in, and the pipeline owns it for the duration of that request.
#[derive(Debug, Clone)]
pub enum ItemContent {
    Text(String),
    /// An encoded image (jpeg, png, ...)
    ImageBytes(Vec<u8>),
    /// Pre-decoded pixels in CHW order; still normalized by preprocessing
    ImageArray { data: Vec<f32>, shape: [usize; 3] },
}

/// Content decoding boundary.
///
/// Implementations turn raw content into a model-ready tensor. Pixel tensors
/// must come out at the one fixed shape the model expects. Runs on pool
/// worker threads, so implementations carry no per-request state.
pub trait Decode: Send + Sync {
    fn decode(&self, content: ItemContent) -> Result<Tensor, String>;
}

/// Bounded pool of preprocessing workers.
///
/// Constructed once at process start and shared by every request. Excess
/// batches queue on the channel and wait for a free worker instead of
/// spawning new ones.
#[derive(Debug, Clone)]
pub struct PreprocessPool {
    /// Channel to communicate with the worker threads
    sender: async_channel::Sender<PreprocessRequest>,
}

impl PreprocessPool {
    pub fn new(workers: usize, decoder: Arc<dyn Decode>) -> Result<Self, ClipEmbeddingsError> {
        if workers == 0 {
            return Err(ClipEmbeddingsError::Config(
                "`pool_size` must be > 0".to_string(),
            ));
        }

        tracing::info!("Starting {workers} preprocessing workers");

        // Create channel
        let (sender, receiver) = async_channel::bounded(workers * 4);

        // Create workers
        for _ in 0..workers {
            let decoder_clone = decoder.clone();
            let receiver_clone = receiver.clone();
            // Spawn worker
            std::thread::spawn(move || preprocess_worker(decoder_clone, receiver_clone));
        }

        Ok(Self { sender })
    }

    /// Decode a batch of items, preserving input order.
    ///
    /// Items are spread over idle workers; a malformed item only poisons its
    /// own slot and the rest of the batch proceeds.
    #[instrument(skip_all)]
    pub async fn preprocess(&self, items: Vec<ItemContent>) -> Vec<Result<Tensor, String>> {
        let mut receivers = Vec::with_capacity(items.len());

        for content in items {
            // Create response channel
            let (response_sender, response_receiver) = oneshot::channel();
            // Send request to the worker pool
            // Unwrap is safe here
            self.sender
                .send(PreprocessRequest {
                    content,
                    response_sender,
                    span: Span::current(),
                })
                .await
                .expect("Preprocessing workers dropped the receiver. This is a bug.");
            receivers.push(response_receiver);
        }

        // Await responses in item order
        let mut tensors = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            let tensor = receiver.await.expect(
                "Preprocessing worker dropped the sender without sending a response. This is a bug.",
            );
            tensors.push(tensor);
        }
        tensors
    }
}

/// Start preprocessing workers
fn preprocess_worker(
    decoder: Arc<dyn Decode>,
    receiver: async_channel::Receiver<PreprocessRequest>,
) {
    // Loop over requests
    while let Ok(request) = receiver.recv_blocking() {
        request.span.in_scope(|| {
            // It's possible that the client dropped its request; skip the work
            if !request.response_sender.is_closed() {
                let result = decoder.decode(request.content);
                if result.is_err() {
                    let counter = metrics::counter!("ce_request_failure", "err" => "decode");
                    counter.increment(1);
                }
                let _ = request.response_sender.send(result);
            }
        })
    }
}

struct PreprocessRequest {
    content: ItemContent,
    response_sender: oneshot::Sender<Result<Tensor, String>>,
    span: Span,
}
