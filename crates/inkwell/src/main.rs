//! Inkwell simulator
//!
//! Opens several sessions on one document served by the in-memory authority,
//! makes seeded random edits from each, then checks every replica converged.
//!
//! Usage:
//!   cargo run -p inkwell -- --clients 4 --rounds 200 --seed 7
//!   cargo run -p inkwell -- --polling --rounds 5

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use collab::{DocumentId, DocumentSession, MemoryServer, SessionHandle, SyncConfig, UserId};
use futures::future::try_join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use telemetry::{LogLevel, TelemetryConfig};
use tracing::{info, warn};

/// Collaborative editing simulator
#[derive(Parser, Debug)]
#[command(name = "inkwell-sim")]
#[command(about = "Run concurrent editing sessions and report convergence")]
struct Args {
    /// Number of concurrent sessions
    #[arg(short, long, default_value_t = 3)]
    clients: usize,

    /// Number of random edits
    #[arg(short, long, default_value_t = 50)]
    rounds: usize,

    /// Seed for the edit generator
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Initial document content
    #[arg(long, default_value = "The quick brown fox jumps over the lazy dog.")]
    text: String,

    /// Refuse push connections so sessions fall back to snapshot polling
    #[arg(long)]
    polling: bool,

    /// Sync configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level, unless RUST_LOG is set
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

const WORDS: &[&str] = &["ink", " well", "née", " 東京", "draft", " ✎", "merge", " "];

/// Apply one random insert or delete to `content`
fn mutate(content: &str, rng: &mut StdRng) -> String {
    let mut chars: Vec<char> = content.chars().collect();
    if chars.is_empty() || rng.gen_bool(0.6) {
        let at = rng.gen_range(0..=chars.len());
        let word = WORDS[rng.gen_range(0..WORDS.len())];
        chars.splice(at..at, word.chars());
    } else {
        let at = rng.gen_range(0..chars.len());
        let len = rng.gen_range(1..=(chars.len() - at).min(4));
        chars.drain(at..at + len);
    }
    chars.into_iter().collect()
}

async fn open_sessions(
    config: &SyncConfig,
    server: &MemoryServer,
    document: DocumentId,
    clients: usize,
) -> Result<Vec<SessionHandle>> {
    let mut sessions = Vec::with_capacity(clients);
    for _ in 0..clients {
        let session = DocumentSession::open(
            config.clone(),
            Arc::new(server.clone()),
            Arc::new(server.clone()),
            document,
            UserId::new(),
        )
        .await?;
        sessions.push(session);
    }
    Ok(sessions)
}

/// Random concurrent edits over the push channel
async fn run_live(args: &Args, sessions: &[SessionHandle], rng: &mut StdRng) -> Result<()> {
    for round in 0..args.rounds {
        let session = &sessions[rng.gen_range(0..sessions.len())];
        let view = session.view().await?;
        session.edit(mutate(&view.content, rng)).await?;
        if round % 10 == 0 {
            info!(round, pending = view.pending, "editing");
        }
        tokio::time::sleep(Duration::from_millis(rng.gen_range(0..40))).await;
    }
    Ok(())
}

/// Edit and save in turn, waiting for the others to poll
async fn run_polling(args: &Args, config: &SyncConfig, sessions: &[SessionHandle], rng: &mut StdRng) -> Result<()> {
    for round in 0..args.rounds {
        let session = &sessions[round % sessions.len()];
        let view = session.view().await?;
        if view.conflict.is_some() {
            warn!(round, "conflict raised, taking remote");
            session.accept_remote().await?;
        }
        let view = session.view().await?;
        session.edit(mutate(&view.content, rng)).await?;
        session.save().await?;
        info!(round, "saved");
        tokio::time::sleep(config.poll_interval + Duration::from_millis(100)).await;
    }
    Ok(())
}

/// Wait until every session has drained and agrees, or give up
async fn settle(config: &SyncConfig, sessions: &[SessionHandle]) -> Result<Vec<String>> {
    let deadline = tokio::time::Instant::now() + config.max_debounce + config.poll_interval * 2;
    loop {
        tokio::time::sleep(config.max_debounce).await;
        let views = try_join_all(sessions.iter().map(|s| s.view())).await?;
        let drained = views.iter().all(|v| v.pending == 0);
        let contents: Vec<String> = views.into_iter().map(|v| v.content).collect();
        if drained && contents.windows(2).all(|w| w[0] == w[1]) {
            return Ok(contents);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(contents);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(&TelemetryConfig::default().with_level(args.log_level).json(args.json))?;

    let config = match &args.config {
        Some(path) => SyncConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if args.clients == 0 {
        bail!("at least one client is required");
    }

    let server = MemoryServer::new();
    server.set_refuse_push(args.polling);
    let document = server.create_document(args.text.clone());
    let sessions = open_sessions(&config, &server, document, args.clients).await?;
    info!(%document, clients = args.clients, rounds = args.rounds, seed = args.seed, "simulation started");

    let mut rng = StdRng::seed_from_u64(args.seed);
    if args.polling {
        run_polling(&args, &config, &sessions, &mut rng).await?;
    } else {
        run_live(&args, &sessions, &mut rng).await?;
    }

    let contents = settle(&config, &sessions).await?;
    let authoritative = server
        .snapshot(document)
        .map(|snapshot| snapshot.content)
        .unwrap_or_default();
    let history = sessions[0].history().await?;
    let contributions = sessions[0].contributions().await?;

    println!("final: {authoritative:?}");
    println!("versions: {}", history.len());
    for contribution in &contributions {
        println!("  {} made {} edits", contribution.user_id, contribution.operations);
    }

    for session in &sessions {
        session.close().await?;
    }

    let diverged: Vec<usize> = contents
        .iter()
        .enumerate()
        .filter(|(_, content)| **content != authoritative)
        .map(|(index, _)| index)
        .collect();
    if !diverged.is_empty() {
        for index in &diverged {
            warn!(client = index, content = ?contents[*index], "replica diverged");
        }
        bail!("{} of {} replicas diverged", diverged.len(), contents.len());
    }
    println!("all {} replicas converged", contents.len());
    Ok(())
}
