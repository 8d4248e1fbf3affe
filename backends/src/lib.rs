mod dtype;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{instrument, Span};

pub use crate::dtype::DType;
pub use clip_embeddings_backend_core::{
    Backend as CoreBackend, BackendError, Batch, Embeddings, SimilarityMetric, Tensor,
};

#[cfg(feature = "ort")]
use clip_embeddings_backend_ort::OrtBackend;

/// Uniform handle over a concrete inference engine.
///
/// The engine lives on a dedicated thread behind a command channel, so a
/// non-reentrant engine (a single device context) only ever sees one
/// inference at a time while callers overlap their preprocessing freely.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Channel to communicate with the background thread
    backend_sender: mpsc::Sender<BackendCommand>,
    /// Health status
    health_receiver: watch::Receiver<bool>,
    _backend_thread: Arc<BackendThread>,
    pub max_batch_size: Option<usize>,
    pub metric: SimilarityMetric,
}

impl Backend {
    pub fn new(model_path: PathBuf, dtype: DType) -> Result<Self, BackendError> {
        let engine = init_backend(model_path, dtype)?;
        Ok(Self::start(engine))
    }

    /// Wrap an already constructed engine.
    ///
    /// Engine variants are selected once at process start; tests use this to
    /// run the serving path against purpose-built engines.
    pub fn start(engine: Box<dyn CoreBackend + Send>) -> Self {
        let (backend_sender, backend_receiver) = mpsc::channel(8);

        let max_batch_size = engine.max_batch_size();
        let metric = engine.metric();

        let (health_sender, health_receiver) = watch::channel(false);
        let _backend_thread =
            Arc::new(BackendThread::new(engine, backend_receiver, health_sender));

        Self {
            backend_sender,
            health_receiver,
            _backend_thread,
            max_batch_size,
            metric,
        }
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<(), BackendError> {
        if *self.health_receiver.borrow() {
            // The backend is healthy. Only do a basic health check by calling the
            // the underlying health method.

            let (sender, receiver) = oneshot::channel();
            self.backend_sender
                .send(BackendCommand::Health(Span::current(), sender))
                .await
                .expect("No backend receiver. This is a bug.");
            receiver.await.expect(
                "Backend blocking task dropped the sender without sending a response. This is a bug.",
            )
        } else {
            // The backend is un-healthy or only just started. Do a more advanced health check
            // by embedding a single token batch

            let batch = Batch {
                input_ids: vec![0],
                cumulative_seq_lengths: vec![0, 1],
                max_length: 1,
                text_indices: vec![0],
                ..Default::default()
            };
            self.embed(batch).await.map(|_| ())
        }
    }

    #[instrument(skip(self))]
    pub fn health_watcher(&self) -> watch::Receiver<bool> {
        self.health_receiver.clone()
    }

    #[instrument(skip_all)]
    pub async fn embed(&self, batch: Batch) -> Result<(Embeddings, Duration), BackendError> {
        let (sender, receiver) = oneshot::channel();

        self.backend_sender
            .send(BackendCommand::Embed(batch, Span::current(), sender))
            .await
            .expect("No backend receiver. This is a bug.");
        receiver.await.expect(
            "Backend blocking task dropped the sender without send a response. This is a bug.",
        )
    }
}

#[allow(unused)]
fn init_backend(
    model_path: PathBuf,
    dtype: DType,
) -> Result<Box<dyn CoreBackend + Send>, BackendError> {
    if cfg!(feature = "ort") {
        #[cfg(feature = "ort")]
        {
            let backend = OrtBackend::new(&model_path, dtype.to_string());
            match backend {
                Ok(b) => return Ok(Box::new(b)),
                Err(err) => {
                    tracing::error!("Could not start ORT backend: {err}");
                    return Err(err);
                }
            }
        }
    }

    Err(BackendError::NoBackend)
}

#[derive(Debug)]
struct BackendThread(Option<JoinHandle<()>>);

impl BackendThread {
    fn new(
        engine: Box<dyn CoreBackend + Send>,
        mut backend_receiver: mpsc::Receiver<BackendCommand>,
        health_sender: watch::Sender<bool>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            while let Some(cmd) = backend_receiver.blocking_recv() {
                let start = Instant::now();
                let mut healthy = false;
                match cmd {
                    BackendCommand::Health(span, sender) => {
                        let _span = span.entered();
                        let _ = sender.send(engine.health().map(|_| healthy = true));
                    }
                    BackendCommand::Embed(batch, span, sender) => {
                        let _span = span.entered();
                        let _ = sender.send(engine.embed(batch).map(|e| {
                            healthy = true;
                            (e, start.elapsed())
                        }));
                    }
                };
                let _ = health_sender.send(healthy);
            }
        });
        Self(Some(handle))
    }
}

impl Drop for BackendThread {
    fn drop(&mut self) {
        self.0.take().unwrap().join().unwrap();
    }
}

enum BackendCommand {
    Health(Span, oneshot::Sender<Result<(), BackendError>>),
    Embed(
        Batch,
        Span,
        #[allow(clippy::type_complexity)]
        oneshot::Sender<Result<(Embeddings, Duration), BackendError>>,
    ),
}
