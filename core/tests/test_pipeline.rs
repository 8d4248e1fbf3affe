use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clip_embeddings_backend::{
    Backend, BackendError, Batch, CoreBackend, Embeddings, SimilarityMetric, Tensor,
};
use clip_embeddings_core::infer::{Infer, ItemError, RetryPolicy};
use clip_embeddings_core::preprocess::{Decode, ItemContent, PreprocessPool};
use clip_embeddings_core::ClipEmbeddingsError;

/// Sentinel token id that makes `TestEngine` fail the whole batch
const POISON_ID: u32 = 666;

/// Decoder with deterministic output so expected embeddings can be computed
/// from the raw input.
///
/// Text maps to its byte values as token ids; images map to their first
/// three bytes as a fixed-shape pixel tensor. `!bad` fails decoding, `!boom`
/// decodes into the poison token.
struct TestDecoder {
    calls: Arc<AtomicUsize>,
    delays: Vec<(String, u64)>,
}

impl TestDecoder {
    fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            delays: Vec::new(),
        }
    }

    fn with_delays(calls: Arc<AtomicUsize>, delays: Vec<(String, u64)>) -> Self {
        Self { calls, delays }
    }
}

impl Decode for TestDecoder {
    fn decode(&self, content: ItemContent) -> Result<Tensor, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match content {
            ItemContent::Text(text) => {
                if let Some((_, ms)) = self.delays.iter().find(|(t, _)| *t == text) {
                    std::thread::sleep(Duration::from_millis(*ms));
                }
                if text == "!bad" {
                    return Err("unsupported content".to_string());
                }
                if text == "!boom" {
                    return Ok(Tensor::TokenIds(vec![POISON_ID]));
                }
                Ok(Tensor::TokenIds(
                    text.bytes().map(|b| b as u32).collect(),
                ))
            }
            ItemContent::ImageBytes(bytes) => {
                if bytes.len() < 3 {
                    return Err("truncated image".to_string());
                }
                Ok(Tensor::Pixels {
                    data: bytes[..3].iter().map(|b| *b as f32).collect(),
                    shape: [3, 1, 1],
                })
            }
            ItemContent::ImageArray { data, shape } => Ok(Tensor::Pixels { data, shape }),
        }
    }
}

/// Engine with embeddings derived from the batch contents: texts embed to
/// `[sum(ids), len(ids)]`, images to their first two pixel values.
struct TestEngine {
    calls: Arc<AtomicUsize>,
    fail_first: usize,
    poisoned: bool,
    delay: Option<Duration>,
    metric: SimilarityMetric,
}

impl TestEngine {
    fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            fail_first: 0,
            poisoned: true,
            delay: None,
            metric: SimilarityMetric::Cosine,
        }
    }
}

impl CoreBackend for TestEngine {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    fn embed(&self, batch: Batch) -> Result<Embeddings, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if call < self.fail_first {
            return Err(BackendError::Inference("transient engine fault".to_string()));
        }
        if self.poisoned && batch.input_ids.contains(&POISON_ID) {
            return Err(BackendError::Inference("out of memory".to_string()));
        }

        let mut embeddings = Embeddings::default();

        let [c, h, w] = batch.pixel_shape;
        let row = c * h * w;
        for (r, i) in batch.image_indices.iter().enumerate() {
            let data = &batch.pixel_values[r * row..(r + 1) * row];
            embeddings.insert(*i as usize, vec![data[0], data[1]]);
        }

        for (r, i) in batch.text_indices.iter().enumerate() {
            let start = batch.cumulative_seq_lengths[r] as usize;
            let end = batch.cumulative_seq_lengths[r + 1] as usize;
            let ids = &batch.input_ids[start..end];
            let sum: u32 = ids.iter().sum();
            embeddings.insert(*i as usize, vec![sum as f32, ids.len() as f32]);
        }

        Ok(embeddings)
    }
}

fn expected_text_embedding(text: &str) -> Vec<f32> {
    let sum: u32 = text.bytes().map(|b| b as u32).sum();
    vec![sum as f32, text.len() as f32]
}

struct TestHarness {
    infer: Infer,
    decode_calls: Arc<AtomicUsize>,
    engine_calls: Arc<AtomicUsize>,
}

fn harness_with(
    workers: usize,
    batch_size: usize,
    retry_policy: RetryPolicy,
    configure: impl FnOnce(&mut TestEngine, &mut TestDecoder),
) -> TestHarness {
    let decode_calls = Arc::new(AtomicUsize::new(0));
    let engine_calls = Arc::new(AtomicUsize::new(0));

    let mut engine = TestEngine::new(engine_calls.clone());
    let mut decoder = TestDecoder::new(decode_calls.clone());
    configure(&mut engine, &mut decoder);

    let backend = Backend::start(Box::new(engine));
    let pool = PreprocessPool::new(workers, Arc::new(decoder)).unwrap();
    let infer = Infer::new(pool, backend, batch_size, retry_policy, 512).unwrap();

    TestHarness {
        infer,
        decode_calls,
        engine_calls,
    }
}

fn harness(workers: usize, batch_size: usize) -> TestHarness {
    harness_with(workers, batch_size, RetryPolicy::None, |_, _| {})
}

fn texts(values: &[&str]) -> Vec<ItemContent> {
    values
        .iter()
        .map(|v| ItemContent::Text(v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_empty_request() {
    let h = harness(2, 4);

    let permit = h.infer.acquire_permit().await;
    let results = h.infer.embed(Vec::new(), permit).await;

    assert!(results.is_empty());
    assert_eq!(h.decode_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ordering_invariant() {
    // Item counts around the batch boundary, assorted pool and batch sizes
    let batch_size = 4;
    for count in [1_usize, 7, batch_size, batch_size + 1, 10 * batch_size] {
        for workers in [1_usize, 3] {
            let h = harness(workers, batch_size);

            let inputs: Vec<String> = (0..count).map(|i| format!("item-{i}")).collect();
            let items: Vec<ItemContent> =
                inputs.iter().map(|t| ItemContent::Text(t.clone())).collect();

            let permit = h.infer.acquire_permit().await;
            let results = h.infer.embed(items, permit).await;

            assert_eq!(results.len(), count);
            for (i, result) in results.iter().enumerate() {
                assert_eq!(
                    result.as_ref().unwrap(),
                    &expected_text_embedding(&inputs[i]),
                    "output {i} does not match input {i} (count={count}, workers={workers})"
                );
            }
        }
    }
}

#[tokio::test]
async fn test_pipelined_matches_sequential() {
    let inputs: Vec<String> = (0..23).map(|i| format!("sample-{i}")).collect();

    // batch_size >= item count degenerates into a single unpipelined batch
    let pipelined = harness(3, 4);
    let sequential = harness(1, 64);

    let permit = pipelined.infer.acquire_permit().await;
    let a = pipelined
        .infer
        .embed(
            inputs.iter().map(|t| ItemContent::Text(t.clone())).collect(),
            permit,
        )
        .await;

    let permit = sequential.infer.acquire_permit().await;
    let b = sequential
        .infer
        .embed(
            inputs.iter().map(|t| ItemContent::Text(t.clone())).collect(),
            permit,
        )
        .await;

    let a: Vec<Vec<f32>> = a.into_iter().map(|r| r.unwrap()).collect();
    let b: Vec<Vec<f32>> = b.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_decode_failure_is_confined_to_its_slot() {
    let h = harness(2, 8);

    let items = texts(&["a", "b", "!bad", "d", "e"]);
    let permit = h.infer.acquire_permit().await;
    let results = h.infer.embed(items, permit).await;

    assert_eq!(results.len(), 5);
    for (i, expected) in [(0, "a"), (1, "b"), (3, "d"), (4, "e")] {
        assert_eq!(
            results[i].as_ref().unwrap(),
            &expected_text_embedding(expected)
        );
    }
    match &results[2] {
        Err(ItemError::Decode(_)) => {}
        other => panic!("expected decode failure marker, got {other:?}"),
    }
}

#[tokio::test]
async fn test_inference_failure_is_confined_to_its_batch() {
    // Two batches; the poison lands in the second one
    let h = harness(2, 2);

    let items = texts(&["a", "b", "!boom", "d"]);
    let permit = h.infer.acquire_permit().await;
    let results = h.infer.embed(items, permit).await;

    assert_eq!(results.len(), 4);
    assert_eq!(results[0].as_ref().unwrap(), &expected_text_embedding("a"));
    assert_eq!(results[1].as_ref().unwrap(), &expected_text_embedding("b"));
    for i in [2, 3] {
        match &results[i] {
            Err(ItemError::Inference(_)) => {}
            other => panic!("expected inference failure marker at {i}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_ordering_with_uneven_preprocess_latency() {
    // The second image finishes preprocessing first; outputs must not swap
    for batch_size in [1_usize, 2] {
        let h = harness_with(2, batch_size, RetryPolicy::None, |engine, decoder| {
            engine.delay = Some(Duration::from_millis(10));
            decoder.delays = vec![("catA".to_string(), 80), ("catB".to_string(), 5)];
        });

        let items = texts(&["catA", "catB"]);
        let permit = h.infer.acquire_permit().await;
        let results = h.infer.embed(items, permit).await;

        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].as_ref().unwrap(),
            &expected_text_embedding("catA")
        );
        assert_eq!(
            results[1].as_ref().unwrap(),
            &expected_text_embedding("catB")
        );
    }
}

#[tokio::test]
async fn test_mixed_modalities_in_one_batch() {
    let h = harness(2, 8);

    let items = vec![
        ItemContent::Text("hello".to_string()),
        ItemContent::ImageBytes(vec![7, 9, 11]),
        ItemContent::Text("world".to_string()),
    ];
    let permit = h.infer.acquire_permit().await;
    let results = h.infer.embed(items, permit).await;

    assert_eq!(
        results[0].as_ref().unwrap(),
        &expected_text_embedding("hello")
    );
    assert_eq!(results[1].as_ref().unwrap(), &vec![7.0, 9.0]);
    assert_eq!(
        results[2].as_ref().unwrap(),
        &expected_text_embedding("world")
    );
}

#[tokio::test]
async fn test_retry_policy_recovers_transient_faults() {
    let h = harness_with(1, 8, RetryPolicy::Fixed(2), |engine, _| {
        engine.fail_first = 2;
    });

    let permit = h.infer.acquire_permit().await;
    let results = h.infer.embed(texts(&["a", "b"]), permit).await;

    assert!(results.iter().all(|r| r.is_ok()));
    // First call failed twice before the third attempt succeeded
    assert_eq!(h.engine_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_no_retry_without_policy() {
    let h = harness_with(1, 8, RetryPolicy::None, |engine, _| {
        engine.fail_first = 1;
    });

    let permit = h.infer.acquire_permit().await;
    let results = h.infer.embed(texts(&["a"]), permit).await;

    assert!(matches!(results[0], Err(ItemError::Inference(_))));
    assert_eq!(h.engine_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rank_returns_every_candidate_once() {
    let h = harness(2, 8);

    let permit = h.infer.acquire_permit().await;
    let ranks = h
        .infer
        .rank(
            ItemContent::Text("a photo of a cat".to_string()),
            texts(&["catA", "dogA", "catB"]),
            permit,
        )
        .await
        .unwrap();

    assert_eq!(ranks.len(), 3);
    let mut indices: Vec<usize> = ranks.iter().map(|r| r.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2]);
    for pair in ranks.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn test_rank_is_deterministic() {
    let h = harness(3, 2);

    let mut previous: Option<Vec<(usize, f32)>> = None;
    for _ in 0..5 {
        let permit = h.infer.acquire_permit().await;
        let ranks = h
            .infer
            .rank(
                ItemContent::Text("query".to_string()),
                texts(&["aa", "bb", "cc", "dd", "ee"]),
                permit,
            )
            .await
            .unwrap();

        let ordering: Vec<(usize, f32)> = ranks.iter().map(|r| (r.index, r.score)).collect();
        if let Some(previous) = &previous {
            assert_eq!(previous, &ordering);
        }
        previous = Some(ordering);
    }
}

#[tokio::test]
async fn test_rank_fails_on_failed_candidate() {
    let h = harness(2, 8);

    let permit = h.infer.acquire_permit().await;
    let err = h
        .infer
        .rank(
            ItemContent::Text("query".to_string()),
            texts(&["fine", "!bad"]),
            permit,
        )
        .await
        .unwrap_err();

    match err {
        ClipEmbeddingsError::Rank(rank_err) => {
            assert!(rank_err.to_string().contains("candidate 1"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_rank_fails_on_failed_query() {
    let h = harness(2, 8);

    let permit = h.infer.acquire_permit().await;
    let err = h
        .infer
        .rank(
            ItemContent::Text("!bad".to_string()),
            texts(&["fine"]),
            permit,
        )
        .await
        .unwrap_err();

    match err {
        ClipEmbeddingsError::Rank(rank_err) => {
            assert!(rank_err.to_string().contains("query"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let decode_calls = Arc::new(AtomicUsize::new(0));
    let engine_calls = Arc::new(AtomicUsize::new(0));

    assert!(matches!(
        PreprocessPool::new(0, Arc::new(TestDecoder::new(decode_calls.clone()))),
        Err(ClipEmbeddingsError::Config(_))
    ));

    let backend = Backend::start(Box::new(TestEngine::new(engine_calls)));
    let pool = PreprocessPool::new(1, Arc::new(TestDecoder::new(decode_calls))).unwrap();
    assert!(matches!(
        Infer::new(pool, backend, 0, RetryPolicy::None, 512),
        Err(ClipEmbeddingsError::Config(_))
    ));
}

#[tokio::test]
async fn test_batch_size_clamped_to_engine_limit() {
    struct BoundedEngine(TestEngine);

    impl CoreBackend for BoundedEngine {
        fn health(&self) -> Result<(), BackendError> {
            self.0.health()
        }
        fn max_batch_size(&self) -> Option<usize> {
            Some(2)
        }
        fn embed(&self, batch: Batch) -> Result<Embeddings, BackendError> {
            assert!(batch.len() <= 2, "engine got a batch above its limit");
            self.0.embed(batch)
        }
    }

    let decode_calls = Arc::new(AtomicUsize::new(0));
    let engine_calls = Arc::new(AtomicUsize::new(0));

    let backend = Backend::start(Box::new(BoundedEngine(TestEngine::new(engine_calls))));
    let pool = PreprocessPool::new(2, Arc::new(TestDecoder::new(decode_calls))).unwrap();
    let infer = Infer::new(pool, backend, 8, RetryPolicy::None, 512).unwrap();

    assert_eq!(infer.batch_size(), 2);

    let permit = infer.acquire_permit().await;
    let results = infer.embed(texts(&["a", "b", "c", "d", "e"]), permit).await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.is_ok()));
}

#[tokio::test]
async fn test_concurrent_requests_share_the_pool() {
    let h = harness(2, 2);

    let mut handles = Vec::new();
    for r in 0..8 {
        let infer = h.infer.clone();
        handles.push(tokio::spawn(async move {
            let inputs: Vec<String> = (0..5).map(|i| format!("req{r}-item{i}")).collect();
            let items: Vec<ItemContent> =
                inputs.iter().map(|t| ItemContent::Text(t.clone())).collect();
            let permit = infer.acquire_permit().await;
            let results = infer.embed(items, permit).await;
            (inputs, results)
        }));
    }

    for handle in handles {
        let (inputs, results) = handle.await.unwrap();
        assert_eq!(results.len(), inputs.len());
        for (input, result) in inputs.iter().zip(results) {
            assert_eq!(result.unwrap(), expected_text_embedding(input));
        }
    }
}
