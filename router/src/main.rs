use anyhow::Result;
use clap::Parser;
use clip_embeddings_backend::DType;
use opentelemetry::global;
use std::path::PathBuf;
use veil::Redact;

#[cfg(not(target_os = "linux"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// App Configuration
#[derive(Parser, Redact)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Local directory containing the model artifacts: `visual.onnx`,
    /// `textual.onnx` and `tokenizer.json`
    #[clap(default_value = "model", long, env)]
    model_path: PathBuf,

    /// The dtype to be forced upon the model.
    #[clap(long, env, value_enum)]
    dtype: Option<DType>,

    /// Number of preprocessing workers decoding client content into
    /// model-ready tensors.
    ///
    /// The pool is created once at startup and shared by every request;
    /// under load, batches queue for a free worker instead of growing the
    /// pool.
    #[clap(default_value = "4", long, env)]
    pool_size: usize,

    /// Maximum number of items handed to the model in one forward pass.
    ///
    /// Requests larger than this are split into consecutive batches and
    /// pipelined: while one batch runs on the model, the next one is already
    /// being preprocessed.
    #[clap(default_value = "64", long, env)]
    batch_size: usize,

    /// Number of extra inference attempts for a batch that failed with a
    /// runtime error. `0` reports the failure immediately.
    #[clap(default_value = "0", long, env)]
    retry_attempts: usize,

    /// The maximum amount of concurrent requests for this particular deployment.
    /// Having a low limit will refuse clients requests instead of having them
    /// wait for too long and is usually good to handle backpressure correctly.
    #[clap(default_value = "512", long, env)]
    max_concurrent_requests: usize,

    /// Control the maximum number of inputs that a client can send in a single request
    #[clap(default_value = "32", long, env)]
    max_client_batch_size: usize,

    /// Edge length images are resized and center-cropped to before entering
    /// the visual encoder
    #[clap(default_value = "224", long, env)]
    image_size: usize,

    /// Maximum number of tokens per text input
    #[clap(default_value = "77", long, env)]
    context_length: usize,

    /// The IP address to listen on
    #[clap(default_value = "0.0.0.0", long, env)]
    hostname: String,

    /// The port to listen on.
    #[clap(default_value = "3000", long, short, env)]
    port: u16,

    /// Payload size limit in bytes
    ///
    /// Default is 2MB
    #[clap(default_value = "2000000", long, env)]
    payload_limit: usize,

    /// Set an api key for request authorization.
    ///
    /// By default the server responds to every request. With an api key set, the requests must have the Authorization header set with the api key as Bearer token.
    #[clap(long, env)]
    #[redact(partial)]
    api_key: Option<String>,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,

    /// The grpc endpoint for opentelemetry. Telemetry is sent to this endpoint as OTLP over gRPC.
    /// e.g. `http://localhost:4317`
    #[clap(long, env)]
    otlp_endpoint: Option<String>,

    /// The service name for opentelemetry.
    /// e.g. `clip-embeddings-inference.server`
    #[clap(default_value = "clip-embeddings-inference.server", long, env)]
    otlp_service_name: String,

    /// The Prometheus port to listen on.
    #[clap(default_value = "9000", long, env)]
    prometheus_port: u16,

    #[clap(long, env)]
    cors_allow_origin: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    // Initialize logging and telemetry
    let global_tracer = clip_embeddings_router::init_logging(
        args.otlp_endpoint.as_ref(),
        args.otlp_service_name.clone(),
        args.json_output,
        args.disable_spans,
    );

    tracing::info!("{args:?}");

    // Hack to trim pages regularly
    // see: https://www.algolia.com/blog/engineering/when-allocators-are-hoarding-your-precious-memory/
    #[cfg(target_os = "linux")]
    tokio::spawn(async move {
        use tokio::time::Duration;
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            unsafe {
                libc::malloc_trim(0);
            }
        }
    });

    clip_embeddings_router::run(
        args.model_path,
        args.dtype,
        args.pool_size,
        args.batch_size,
        args.retry_attempts,
        args.max_concurrent_requests,
        args.max_client_batch_size,
        args.image_size,
        args.context_length,
        Some(args.hostname),
        args.port,
        args.payload_limit,
        args.api_key,
        args.prometheus_port,
        args.cors_allow_origin,
    )
    .await?;

    if global_tracer {
        // Shutdown tracer
        global::shutdown_tracer_provider();
    }
    Ok(())
}
