//! CLI entrypoint for inspecting and exercising configured LLM endpoints.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use llm::{
    AskRequest, Config, ConfigKind, EndpointDescriptor, GatewayFactory, ImageAskRequest,
    ImageInput, TokenCounter,
};
use proto::CanonicalMessage;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "llmgate")]
#[command(about = "Provider-agnostic LLM gateway", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging to ~/.llmgate/logs/debug.log
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Selects one configured endpoint.
#[derive(Debug, clap::Args)]
struct EndpointArgs {
    /// Configuration family (general or extraction)
    #[arg(short, long, default_value = "general")]
    kind: ConfigKind,

    /// Named block within the family
    #[arg(short, long, default_value = llm::config::DEFAULT_CONFIG_NAME)]
    name: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the resolved endpoint (credentials redacted)
    Resolve {
        #[command(flatten)]
        endpoint: EndpointArgs,
    },

    /// Estimate prompt tokens for a single user message
    Tokens {
        /// Message text
        text: String,

        /// Image URL to include (repeatable)
        #[arg(long = "image")]
        images: Vec<String>,

        #[command(flatten)]
        endpoint: EndpointArgs,
    },

    /// Send one prompt and print the reply
    Ping {
        /// Prompt text
        prompt: String,

        /// Optional system message
        #[arg(short, long)]
        system: Option<String>,

        /// Image URL to attach (repeatable); requires a multimodal model
        #[arg(long = "image")]
        images: Vec<String>,

        /// Stream chunks to stdout as they arrive; a retried attempt is printed again
        #[arg(long, default_value_t = false)]
        stream: bool,

        #[command(flatten)]
        endpoint: EndpointArgs,
    },
}

impl Commands {
    fn label(&self) -> &'static str {
        match self {
            Commands::Resolve { .. } => "resolve",
            Commands::Tokens { .. } => "tokens",
            Commands::Ping { .. } => "ping",
        }
    }
}

#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard = init_tracing(&cli.log_level, cli.debug)?;

    if cli.debug {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = cli.command.label(),
            log_level = %cli.log_level,
            "========== llmgate session start =========="
        );
    }

    let config = load_config(cli.config.as_deref())?;
    let factory = GatewayFactory::new(config);

    match cli.command {
        Commands::Resolve { endpoint } => {
            let descriptor = factory.resolve(endpoint.kind, &endpoint.name);
            println!("{}", describe(&descriptor));
            Ok(())
        }
        Commands::Tokens {
            text,
            images,
            endpoint,
        } => {
            let descriptor = factory.resolve(endpoint.kind, &endpoint.name);
            let tokens = estimate_tokens(&descriptor.model, &text, &images);
            println!("{tokens}");
            Ok(())
        }
        Commands::Ping {
            prompt,
            system,
            images,
            stream,
            endpoint,
        } => cmd_ping(&factory, endpoint, prompt, system, images, stream).await,
    }
}

/// Console output filtered by `log_level`; `--debug` adds a daily-rotated
/// debug file under `~/.llmgate/logs`.
fn init_tracing(
    log_level: &str,
    debug: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if !debug {
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let log_dir = PathBuf::from(home).join(".llmgate").join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);
    let file = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_filter(EnvFilter::new("debug,hyper_util=info,rustls=info,reqwest=info"));
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Ok(Some(guard))
}

async fn cmd_ping(
    factory: &GatewayFactory,
    endpoint: EndpointArgs,
    prompt: String,
    system: Option<String>,
    images: Vec<String>,
    stream: bool,
) -> anyhow::Result<()> {
    let gateway = factory.gateway(endpoint.kind, &endpoint.name);
    let messages = vec![CanonicalMessage::user(prompt)];
    let system_msgs: Vec<CanonicalMessage> =
        system.into_iter().map(CanonicalMessage::system).collect();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let sink = stream.then_some(tx);
    let printer = tokio::spawn(async move {
        use std::io::Write;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = rx.recv().await {
            let _ = write!(stdout, "{chunk}");
            let _ = stdout.flush();
        }
    });

    let result = if images.is_empty() {
        let mut request = AskRequest::new(messages)
            .with_system(system_msgs)
            .streaming(stream);
        if let Some(sink) = sink {
            request = request.with_sink(sink);
        }
        gateway.ask(request).await
    } else {
        let images = images.into_iter().map(ImageInput::from).collect();
        let mut request = ImageAskRequest::new(messages, images)
            .with_system(system_msgs)
            .streaming(stream);
        if let Some(sink) = sink {
            request = request.with_sink(sink);
        }
        gateway.ask_with_images(request).await
    };
    // The sender is dropped with the request, which ends the printer.
    printer.await.context("stream printer task failed")?;

    let reply = result.with_context(|| {
        format!(
            "request to '{}' ({}) failed",
            endpoint.name,
            gateway.descriptor().provider_kind
        )
    })?;
    if stream {
        println!();
    } else {
        println!("{reply}");
    }

    let usage = gateway.usage();
    info!(
        input = usage.input_tokens,
        completion = usage.completion_tokens,
        "Ping finished"
    );
    Ok(())
}

/// Multi-line summary of a resolved endpoint.
fn describe(descriptor: &EndpointDescriptor) -> String {
    format!(
        "provider:          {}\nmodel:             {}\nbase_url:          {}\napi_version:       {}\napi_key:           {}\nmax_output_tokens: {}\ntemperature:       {}\nmax_input_tokens:  {}",
        descriptor.provider_kind,
        descriptor.model,
        descriptor.base_url.as_deref().unwrap_or("<provider default>"),
        descriptor.api_version.as_deref().unwrap_or("<unset>"),
        if descriptor.key_set() { "<redacted>" } else { "<unset>" },
        descriptor.max_output_tokens,
        descriptor.temperature,
        descriptor
            .max_input_tokens
            .map_or_else(|| "unlimited".to_string(), |max| max.to_string()),
    )
}

fn estimate_tokens(model: &str, text: &str, images: &[String]) -> u64 {
    let mut message = CanonicalMessage::user(text);
    if !images.is_empty() {
        let mut parts = message
            .content
            .take()
            .map(proto::MessageContent::into_parts)
            .unwrap_or_default();
        parts.extend(images.iter().map(|url| proto::ContentPart::ImageUrl {
            image_url: proto::ImagePart::new(url.as_str()),
        }));
        message.content = Some(proto::MessageContent::Parts(parts));
    }
    TokenCounter::for_model(model).count_message_tokens(std::slice::from_ref(&message))
}

/// An explicit path must load; discovered files fall back to defaults.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(Some(path))
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(Config::load(None).unwrap_or_else(|e| {
            warn!("Failed to load config ({e}), using defaults");
            Config::default()
        })),
    }
}
