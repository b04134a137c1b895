use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use llamactx_engine::{
    ChatMessage, Completion, EvaluateOptions, GenerateOptions, InferenceContext, LlamaCtxError,
    Settings, TokenId, chat, complete, system_info,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// llamactx inference server
#[derive(Parser, Debug)]
#[command(name = "llamactx-server")]
#[command(about = "JSON API over a single llama.cpp inference context", long_about = None)]
struct Args {
    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: the user config directory's config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model path or hf://<owner>/<repo>/<file> (overrides [model] source)
    #[arg(short, long)]
    model: Option<String>,

    /// Port to listen on (overrides [server] port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides [server] host)
    #[arg(long)]
    host: Option<String>,
}

#[derive(Clone)]
struct AppState {
    ctx: Arc<InferenceContext>,
    /// Defaults for requests that carry no options
    sampling: EvaluateOptions,
    generation: GenerateOptions,
}

/// Engine error rendered as a JSON body with a matching status code.
struct ApiError(LlamaCtxError);

impl From<LlamaCtxError> for ApiError {
    fn from(e: LlamaCtxError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LlamaCtxError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            LlamaCtxError::ConcurrentEvaluation { .. } => StatusCode::TOO_MANY_REQUESTS,
            LlamaCtxError::NoCacheSlot => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut message = self.0.to_string();
        if let Some(source) = std::error::Error::source(&self.0) {
            message = format!("{}: {}", message, source);
        }
        if status.is_server_error() {
            tracing::error!("{}", message);
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct EncodeRequest {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EncodeBatchRequest {
    texts: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct TokensResponse {
    tokens: Vec<TokenId>,
}

#[derive(Debug, Deserialize)]
struct DecodeRequest {
    tokens: Vec<TokenId>,
}

#[derive(Debug, Deserialize)]
struct DecodeBatchRequest {
    tokens: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct TextResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EvaluateRequest {
    tokens: Vec<TokenId>,
    #[serde(default)]
    options: Option<EvaluateOptions>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateResponse {
    token: TokenId,
    position: usize,
    inference_time_ms: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(flatten)]
    completion: Completion,
    inference_time_ms: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpecialTokensResponse {
    bos: TokenId,
    eos: TokenId,
    nl: TokenId,
    n_vocab: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Default: info level, with --verbose: debug level
    let default_filter = if args.verbose {
        "llamactx_server=debug,llamactx_engine=debug,tower_http=debug"
    } else {
        "llamactx_server=info,llamactx_engine=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = match &args.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Settings::load()?,
    };
    if let Some(model) = args.model {
        settings.model.source = Some(model);
    }

    let source = settings
        .model_source()?
        .context("no model configured; pass --model or set [model] source in the config file")?;
    let path = source.resolve().with_context(|| {
        format!(
            "failed to resolve model {}. Set HF_TOKEN for private repos.",
            source
        )
    })?;

    tracing::info!("Loading model from {}...", path.display());
    let ctx = InferenceContext::with_config(
        &path,
        settings.model_options(),
        settings.context_config(),
    )
    .with_context(|| format!("failed to load model {}", path.display()))?;
    tracing::info!("Model loaded ({} vocab entries)", ctx.n_vocab());

    let state = AppState {
        ctx: Arc::new(ctx),
        sampling: settings.evaluate_options(),
        generation: settings.generate_options(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state)
        .layer(DefaultBodyLimit::max(4 * 1024 * 1024)) // 4 MB
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let host = args.host.unwrap_or(settings.server.host);
    let port = args.port.unwrap_or(settings.server.port);
    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("failed to run server")?;

    tracing::info!("Server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/system_info", get(system_info_handler))
        .route("/api/special_tokens", get(special_tokens_handler))
        .route("/api/encode", post(encode_handler))
        .route("/api/encode_batch", post(encode_batch_handler))
        .route("/api/decode", post(decode_handler))
        .route("/api/decode_batch", post(decode_batch_handler))
        .route("/api/evaluate", post(evaluate_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "llamactx",
        "position": state.ctx.position(),
        "outstanding": state.ctx.outstanding(),
    }))
}

async fn system_info_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "systemInfo": system_info() }))
}

async fn special_tokens_handler(State(state): State<AppState>) -> Json<SpecialTokensResponse> {
    Json(SpecialTokensResponse {
        bos: state.ctx.token_bos(),
        eos: state.ctx.token_eos(),
        nl: state.ctx.token_nl(),
        n_vocab: state.ctx.n_vocab(),
    })
}

async fn encode_handler(
    State(state): State<AppState>,
    Json(req): Json<EncodeRequest>,
) -> ApiResult<TokensResponse> {
    let tokens = state.ctx.encode(&req.text)?;
    Ok(Json(TokensResponse { tokens }))
}

async fn encode_batch_handler(
    State(state): State<AppState>,
    Json(req): Json<EncodeBatchRequest>,
) -> ApiResult<TokensResponse> {
    let tokens = state.ctx.tokenizer().encode_values(&req.texts)?;
    Ok(Json(TokensResponse { tokens }))
}

async fn decode_handler(
    State(state): State<AppState>,
    Json(req): Json<DecodeRequest>,
) -> ApiResult<TextResponse> {
    let text = state.ctx.decode(&req.tokens)?;
    Ok(Json(TextResponse { text }))
}

async fn decode_batch_handler(
    State(state): State<AppState>,
    Json(req): Json<DecodeBatchRequest>,
) -> ApiResult<TextResponse> {
    let text = state.ctx.decode_batch(&req.tokens)?;
    Ok(Json(TextResponse { text }))
}

async fn evaluate_handler(
    State(state): State<AppState>,
    Json(req): Json<EvaluateRequest>,
) -> ApiResult<EvaluateResponse> {
    let options = req.options.unwrap_or_else(|| state.sampling.clone());

    let start = Instant::now();
    let token = state.ctx.evaluate(&req.tokens, options).await?;

    Ok(Json(EvaluateResponse {
        token,
        position: state.ctx.position(),
        inference_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    }))
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<GenerateResponse> {
    let options = req.options.unwrap_or_else(|| state.generation.clone());

    let start = Instant::now();
    let completion = complete(&state.ctx, &req.prompt, &options, |_| {}).await?;
    let inference_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    tracing::debug!(
        "Generated {} tokens in {:.1}ms",
        completion.tokens.len(),
        inference_time_ms
    );

    Ok(Json(GenerateResponse {
        completion,
        inference_time_ms,
    }))
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<GenerateResponse> {
    let options = req.options.unwrap_or_else(|| state.generation.clone());

    let start = Instant::now();
    let completion = chat(&state.ctx, &req.messages, &options, |_| {}).await?;
    let inference_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    tracing::debug!(
        "Chat reply of {} tokens to {} messages in {:.1}ms",
        completion.tokens.len(),
        req.messages.len(),
        inference_time_ms
    );

    Ok(Json(GenerateResponse {
        completion,
        inference_time_ms,
    }))
}
