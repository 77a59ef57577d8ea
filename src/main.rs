//! hecrypt-relay: encrypted prompt relay for LLM services.
//!
//! Subcommands:
//!
//! - `keygen` - create an encryption context and write it to a key file
//! - `serve` - run the relay with a key file
//! - `ask` - send one prompt to a running relay
//! - `demo` - relay and interactive client in one process

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hecrypt_relay::config::{api_key_from_env, Config};
use hecrypt_relay::crypto::EncryptionContext;
use hecrypt_relay::llm::{OpenAiChatService, QueryAdapter};
use hecrypt_relay::relay::{RelayClient, RelayServer};

#[derive(Parser)]
#[command(name = "hecrypt-relay")]
#[command(about = "Relay CKKS-encrypted prompts to an LLM service")]
#[command(version)]
struct Args {
    /// Configuration file (default: <config dir>/hecrypt-relay/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new encryption context and save it
    Keygen {
        /// Key file to write (contains the secret key)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Also write a public-only key file
        #[arg(long)]
        public_out: Option<PathBuf>,
    },

    /// Run the relay server
    Serve {
        #[arg(long)]
        keys: Option<PathBuf>,

        /// Listen address (overrides config)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Send a prompt to a running relay and print the answer
    Ask {
        #[arg(long)]
        keys: Option<PathBuf>,

        /// Relay address (overrides config)
        #[arg(long)]
        relay: Option<SocketAddr>,

        /// Prompt text; read from stdin when omitted
        prompt: Vec<String>,
    },

    /// Start a relay with a fresh context and prompt interactively
    Demo,
}

fn default_key_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hecrypt-relay")
        .join("context.keys")
}

fn load_context(path: Option<PathBuf>) -> Result<Arc<EncryptionContext>> {
    let path = path.unwrap_or_else(default_key_path);
    let ctx = EncryptionContext::load(&path)
        .with_context(|| format!("Failed to load key file {}", path.display()))?;
    Ok(Arc::new(ctx))
}

fn build_adapter(config: &Config) -> Result<QueryAdapter> {
    // Fail before any listener is bound.
    let api_key = api_key_from_env()?;
    let service = OpenAiChatService::new(&config.service, api_key)?;
    info!(endpoint = %service.endpoint(), model = %config.service.model, "LLM service configured");
    Ok(QueryAdapter::new(Arc::new(service), config.service.clone()))
}

async fn keygen(config: &Config, out: Option<PathBuf>, public_out: Option<PathBuf>) -> Result<()> {
    let params = config.scheme.clone();
    let ctx = tokio::task::spawn_blocking(move || EncryptionContext::create(params))
        .await
        .context("Key generation task failed")??;

    let out = out.unwrap_or_else(default_key_path);
    ctx.save(&out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!(
        "wrote {} (fingerprint {}, created {})",
        out.display(),
        ctx.fingerprint_hex(),
        ctx.created_at().format("%Y-%m-%d %H:%M:%S UTC")
    );

    if let Some(public_out) = public_out {
        ctx.public_only()
            .save(&public_out)
            .with_context(|| format!("Failed to write {}", public_out.display()))?;
        println!("wrote {} (public key only)", public_out.display());
    }
    Ok(())
}

async fn serve(mut config: Config, keys: Option<PathBuf>, listen: Option<SocketAddr>) -> Result<()> {
    let adapter = build_adapter(&config)?;
    let ctx = load_context(keys)?;
    if let Some(listen) = listen {
        config.relay.listen_addr = listen;
    }

    let server = RelayServer::bind(config.relay, ctx, adapter).await?;
    println!("relay listening on {}", server.local_addr()?);
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received");
        })
        .await?;
    Ok(())
}

async fn read_prompt_from_stdin() -> Result<String> {
    let mut text = String::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&line);
    }
    Ok(text)
}

async fn ask(
    mut config: Config,
    keys: Option<PathBuf>,
    relay: Option<SocketAddr>,
    prompt: Vec<String>,
) -> Result<()> {
    let ctx = load_context(keys)?;
    if !ctx.can_decrypt() {
        bail!("key file has no secret key; replies cannot be decrypted");
    }
    if let Some(relay) = relay {
        config.client.relay_addr = relay;
    }
    let prompt = if prompt.is_empty() {
        read_prompt_from_stdin().await?
    } else {
        prompt.join(" ")
    };

    let client = RelayClient::new(ctx, config.client);
    let answer = client
        .ask(&prompt)
        .await
        .with_context(|| format!("Relay at {} failed", client.relay_addr()))?;
    println!("{}", answer.text());
    if !answer.is_complete() {
        bail!("{} chunk(s) failed", answer.failures().len());
    }
    Ok(())
}

async fn demo(mut config: Config) -> Result<()> {
    let adapter = build_adapter(&config)?;
    let params = config.scheme.clone();
    let ctx = tokio::task::spawn_blocking(move || EncryptionContext::create(params))
        .await
        .context("Key generation task failed")??;
    let ctx = Arc::new(ctx);

    let server = RelayServer::bind(config.relay.clone(), Arc::clone(&ctx), adapter).await?;
    config.client.relay_addr = server.local_addr()?;
    let handle = server.spawn()?;
    let client = RelayClient::new(ctx, config.client);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout
            .write_all(b"Enter your prompt (or type 'exit' to quit): ")
            .await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().eq_ignore_ascii_case("exit") {
            break;
        }
        match client.ask(&line).await {
            Ok(answer) => println!("{}", answer.text()),
            Err(e) => {
                tracing::error!(error = %e, "prompt failed");
                eprintln!("Error: {e}");
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

fn resolve_config(path: Option<&Path>) -> Result<Config> {
    let config = Config::resolve(path)?;
    config.scheme.validate().context("Invalid scheme parameters")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hecrypt_relay=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = Args::parse();
    let config = resolve_config(args.config.as_deref())?;
    info!("hecrypt-relay v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Keygen { out, public_out } => keygen(&config, out, public_out).await,
        Command::Serve { keys, listen } => serve(config, keys, listen).await,
        Command::Ask { keys, relay, prompt } => ask(config, keys, relay, prompt).await,
        Command::Demo => demo(config).await,
    }
}
