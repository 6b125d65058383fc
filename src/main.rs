//! Parley - conversational analytics assistant core
//!
//! Dev REPL entry point: wires the configured store, the built-in action
//! catalog, and the engine, then routes stdin lines as chat turns.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::{
    ConversationStore, CoreConfig, Engine, MemoryStore, RedisStore, Response, ResponseChunk,
    StoreBackend, Vote,
};
use parley_sandbox::SandboxExecutor;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod actions;

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Conversational analytics assistant core", version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<String>,

    /// Conversation id to use for this session
    #[arg(long, default_value = "local")]
    conversation: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CoreConfig::from_path(path).context("loading configuration")?,
        None => CoreConfig::default(),
    };

    let store: Arc<dyn ConversationStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => Arc::new(
            RedisStore::with_options(
                &config.store.redis_url,
                &config.store.prefix,
                config.store.ttl_secs,
            )
            .context("connecting to redis")?,
        ),
    };

    let sandbox = Arc::new(SandboxExecutor::new(config.sandbox_config()));
    let catalog = Arc::new(actions::build_catalog(sandbox, config.execution_timeout()));
    let engine = Arc::new(Engine::new(config, store, catalog));

    // Drain the observability stream into debug logs
    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!(?event, "core event");
        }
    });

    info!("Parley v{} ready", env!("CARGO_PKG_VERSION"));
    println!("Type a message, '/vote <battle-id> <a|b|tie>' to vote, or 'exit' to quit.");

    repl(engine, &cli.conversation).await
}

async fn repl(engine: Arc<Engine>, conversation_id: &str) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        if let Some(rest) = line.strip_prefix("/vote ") {
            handle_vote(&engine, rest).await;
            continue;
        }

        let mut rx =
            engine.handle_streamed(conversation_id.to_string(), line, CancellationToken::new());
        let mut done = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                ResponseChunk::Delta(delta) => {
                    stdout.write_all(delta.as_bytes()).await?;
                    stdout.flush().await?;
                }
                ResponseChunk::Done(response) => done = Some(response),
            }
        }
        stdout.write_all(b"\n").await?;

        if let Some(Response::Answer {
            result_handle: Some(handle),
            ..
        }) = done
        {
            println!("[result: {}]", handle);
        }
    }

    Ok(())
}

async fn handle_vote(engine: &Engine, rest: &str) {
    let mut parts = rest.split_whitespace();
    let (Some(id), Some(choice)) = (parts.next(), parts.next()) else {
        println!("usage: /vote <battle-id> <a|b|tie>");
        return;
    };
    let Ok(battle_id) = id.parse() else {
        println!("'{}' is not a battle id", id);
        return;
    };
    let vote = match choice.to_lowercase().as_str() {
        "a" => Vote::A,
        "b" => Vote::B,
        "tie" => Vote::Tie,
        other => {
            println!("'{}' is not a vote (a, b, or tie)", other);
            return;
        }
    };

    match engine.vote(battle_id, vote).await {
        Ok(response) => println!("{}", response.text()),
        Err(e) => println!("{}", e.user_message()),
    }
}
