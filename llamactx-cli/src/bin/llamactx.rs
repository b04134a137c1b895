use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use llamactx_engine::{
    ChatMessage, Completion, InferenceContext, Settings, TokenId, chat, complete, system_info,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// llamactx: tokenize, evaluate and generate with a GGUF model.
#[derive(Parser, Debug)]
#[command(name = "llamactx")]
#[command(about = "Tokenize, evaluate and generate with a GGUF model", long_about = None)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: the user config directory's config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model path or hf://<owner>/<repo>/<file> (overrides [model] source)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Context size in tokens
    #[arg(long, global = true)]
    n_ctx: Option<u32>,

    /// Threads for evaluation
    #[arg(long, global = true)]
    threads: Option<u32>,

    /// Layers to offload to the GPU
    #[arg(long, global = true)]
    gpu_layers: Option<u32>,

    /// Sampling seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a completion for a prompt, streaming text to stdout.
    Generate {
        prompt: String,

        /// Maximum number of tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature (0 = greedy)
        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        top_k: Option<i32>,

        #[arg(long)]
        top_p: Option<f32>,

        /// Disable the rolling repeat penalty window
        #[arg(long)]
        no_repeat_penalty: bool,
    },

    /// Send one user message in the Llama 2 chat format and stream the reply.
    Chat {
        message: String,

        /// System prompt placed before the message
        #[arg(long)]
        system: Option<String>,

        /// Maximum number of tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature (0 = greedy)
        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Print the token ids of a text.
    Tokenize {
        text: String,

        /// Print as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Print the text of a list of token ids.
    Detokenize {
        #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
        tokens: Vec<i32>,
    },

    /// Evaluate a text once and print the sampled token.
    Evaluate {
        text: String,

        /// Prepend the BOS token
        #[arg(long)]
        bos: bool,

        /// Sampling temperature (0 = greedy)
        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Print llama.cpp's system information.
    SystemInfo,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load_from(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => Settings::load()?,
        };
        if let Some(model) = &self.model {
            settings.model.source = Some(model.clone());
        }
        if let Some(n_ctx) = self.n_ctx {
            settings.context.n_ctx = n_ctx;
        }
        if let Some(threads) = self.threads {
            settings.context.n_threads = threads;
        }
        if let Some(layers) = self.gpu_layers {
            settings.model.gpu_layers = Some(layers);
        }
        if self.seed.is_some() {
            settings.context.seed = self.seed;
        }
        Ok(settings)
    }
}

fn load_context(settings: &Settings, vocab_only: bool) -> Result<InferenceContext> {
    let Some(source) = settings.model_source()? else {
        bail!("no model configured; pass --model or set [model] source in the config file");
    };
    let path = source
        .resolve()
        .with_context(|| format!("failed to resolve model {}", source))?;

    let mut options = settings.model_options();
    options.vocab_only |= vocab_only;

    let start = Instant::now();
    let ctx = InferenceContext::with_config(&path, options, settings.context_config())
        .with_context(|| format!("failed to load model {}", path.display()))?;
    tracing::info!("Model ready in {:.2}s", start.elapsed().as_secs_f64());
    Ok(ctx)
}

fn prompt_tokens(ctx: &InferenceContext, text: &str, bos: bool) -> Result<Vec<TokenId>> {
    let mut tokens = Vec::new();
    if bos {
        tokens.push(ctx.token_bos());
    }
    tokens.extend(ctx.encode(text)?);
    Ok(tokens)
}

fn chat_messages(message: &str, system: Option<&str>) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(message));
    messages
}

/// Stream text to stdout as it arrives.
fn print_streamed(text: &str) {
    let mut stdout = std::io::stdout();
    let _ = write!(stdout, "{}", text);
    let _ = stdout.flush();
}

fn log_completion(completion: &Completion, start: Instant) {
    tracing::info!(
        "{} prompt + {} generated tokens in {:.2}s ({:?})",
        completion.prompt_tokens,
        completion.tokens.len(),
        start.elapsed().as_secs_f64(),
        completion.finish_reason
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "llamactx=debug,llamactx_engine=debug"
    } else {
        "llamactx=info,llamactx_engine=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &cli.command {
        Commands::SystemInfo => {
            println!("{}", system_info());
        }

        Commands::Tokenize { text, json } => {
            let ctx = load_context(&cli.settings()?, true)?;
            let tokens = ctx.encode(text)?;
            if *json {
                println!("{}", serde_json::to_string(&tokens)?);
            } else {
                let tokenizer = ctx.tokenizer();
                for token in tokens {
                    let piece = tokenizer.token_bytes(token)?;
                    println!("{:>8} {:?}", token, String::from_utf8_lossy(&piece));
                }
            }
        }

        Commands::Detokenize { tokens } => {
            let ctx = load_context(&cli.settings()?, true)?;
            let tokens: Vec<TokenId> = tokens.iter().copied().map(TokenId).collect();
            println!("{}", ctx.decode(&tokens)?);
        }

        Commands::Evaluate {
            text,
            bos,
            temperature,
        } => {
            let settings = cli.settings()?;
            let ctx = load_context(&settings, false)?;
            let tokens = prompt_tokens(&ctx, text, *bos)?;

            let mut options = settings.evaluate_options();
            if let Some(t) = temperature {
                options.temperature = *t;
            }

            let start = Instant::now();
            let next = ctx.evaluate(&tokens, options).await?;
            let piece = ctx.tokenizer().token_bytes(next)?;
            println!(
                "{} {:?} ({} tokens in {:.1}ms)",
                next,
                String::from_utf8_lossy(&piece),
                tokens.len(),
                start.elapsed().as_secs_f64() * 1000.0
            );
        }

        Commands::Generate {
            prompt,
            max_tokens,
            temperature,
            top_k,
            top_p,
            no_repeat_penalty,
        } => {
            let settings = cli.settings()?;
            let ctx = load_context(&settings, false)?;

            let mut options = settings.generate_options();
            if let Some(n) = max_tokens {
                options.max_tokens = *n;
            }
            if let Some(t) = temperature {
                options.sampling.temperature = *t;
            }
            if let Some(k) = top_k {
                options.sampling.top_k = *k;
            }
            if let Some(p) = top_p {
                options.sampling.top_p = *p;
            }
            if *no_repeat_penalty {
                options.penalize_repeats = false;
            }

            let start = Instant::now();
            let completion = complete(&ctx, prompt, &options, print_streamed).await?;
            println!();
            log_completion(&completion, start);
        }

        Commands::Chat {
            message,
            system,
            max_tokens,
            temperature,
        } => {
            let settings = cli.settings()?;
            let ctx = load_context(&settings, false)?;

            let mut options = settings.generate_options();
            if let Some(n) = max_tokens {
                options.max_tokens = *n;
            }
            if let Some(t) = temperature {
                options.sampling.temperature = *t;
            }

            let messages = chat_messages(message, system.as_deref());
            let start = Instant::now();
            let completion = chat(&ctx, &messages, &options, print_streamed).await?;
            println!();
            log_completion(&completion, start);
        }
    }

    Ok(())
}
