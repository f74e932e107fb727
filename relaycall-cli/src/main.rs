//! Relaycall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use relaycall_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod console;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Relay WebSocket URL
    #[arg(short, long, env = "RELAYCALL_RELAY_URL", default_value = "ws://127.0.0.1:5000")]
    relay_url: String,

    /// Name shown to the people you call
    #[arg(short, long, env = "RELAYCALL_NAME")]
    name: Option<String>,

    /// Send audio only
    #[arg(long)]
    audio_only: bool,

    /// Decline incoming calls left unanswered for this many seconds
    #[arg(long)]
    ring_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a peer and stay until the call ends
    Call {
        /// Relay-assigned id of the peer
        peer: String,
    },

    /// Wait for incoming calls
    Listen {
        /// Answer incoming calls without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Run a scripted call between two in-process clients
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("relaycall=info,relaycall_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let name = cli.name.clone().unwrap_or_else(generate_display_name);

    match &cli.command {
        Commands::Call { peer } => handle_call(&cli, &name, peer).await,
        Commands::Listen { auto_accept } => handle_listen(&cli, &name, *auto_accept).await,
        Commands::Demo => handle_demo().await,
    }
}

fn service_config(cli: &Cli, name: &str) -> CallServiceConfig {
    CallServiceConfig {
        transport: TransportConfig {
            url: cli.relay_url.clone(),
            ..TransportConfig::default()
        },
        default_constraints: if cli.audio_only {
            MediaConstraints::audio_only()
        } else {
            MediaConstraints::video_call()
        },
        call_config: CallManagerConfig {
            display_name: Some(name.to_string()),
            ring_timeout: cli.ring_timeout.map(Duration::from_secs),
            ..CallManagerConfig::default()
        },
    }
}

async fn connect(cli: &Cli, name: &str) -> Result<CallService> {
    let config = service_config(cli, name);
    let ws = WebSocketTransport::connect(&config.transport)
        .await
        .with_context(|| format!("connecting to relay at {}", cli.relay_url))?;

    let service = CallService::builder(Arc::new(ws))
        .with_config(config)
        .build()
        .await?;
    let identity = service.start().await?;
    println!("🔗 Relay assigned identity: {identity}");
    println!("👤 Display name: {name}");
    if !service.media().has_media() {
        println!("⚠️  No local media; you can receive calls but not place or answer them");
    }
    Ok(service)
}

async fn handle_call(cli: &Cli, name: &str, peer: &str) -> Result<()> {
    let service = connect(cli, name).await?;
    console::print_help();

    if let Err(e) = service.place_call(PeerId::new(peer)).await {
        service.shutdown().await;
        return Err(e).with_context(|| format!("calling {peer}"));
    }

    let result = console::run(&service, false, true).await;
    service.shutdown().await;
    result
}

async fn handle_listen(cli: &Cli, name: &str, auto_accept: bool) -> Result<()> {
    let service = connect(cli, name).await?;
    println!("👂 Listening for incoming calls...");
    if auto_accept {
        println!("   Auto-accept: enabled");
    }
    console::print_help();

    let result = console::run(&service, auto_accept, false).await;
    service.shutdown().await;
    result
}

/// Alice calls Bob over an in-process relay with loopback links
async fn handle_demo() -> Result<()> {
    let relay = MemoryRelay::new();
    let links = Arc::new(LoopbackNetwork::new());
    let client = |name: &str| {
        let config = CallServiceConfig {
            call_config: CallManagerConfig {
                display_name: Some(name.to_string()),
                ..CallManagerConfig::default()
            },
            ..CallServiceConfig::default()
        };
        CallService::builder(Arc::new(relay.connect()))
            .with_config(config)
            .with_link_factory(links.clone())
            .build()
    };

    let alice = client("Alice").await?;
    let bob = client("Bob").await?;
    let alice_id = alice.start().await?;
    let bob_id = bob.start().await?;
    println!("👤 Alice is {alice_id}, Bob is {bob_id}");

    let mut bob_events = bob.subscribe_events();
    alice.place_call(bob_id).await?;
    loop {
        let event = bob_events.recv().await?;
        if let Some(text) = console::describe(&event) {
            println!("[bob] {text}");
        }
        if matches!(event, CallEvent::IncomingCall { .. }) {
            break;
        }
    }

    bob.answer().await?;
    wait_for(&alice, CallState::Connected).await?;
    wait_for(&bob, CallState::Connected).await?;
    println!("✅ Both sides connected");

    alice.toggle_video();
    let camera = bob
        .snapshot()
        .remote_stream
        .and_then(|s| s.tracks.kind_enabled(MediaKind::Video));
    println!("📷 Alice turned her camera off; Bob sees video enabled = {camera:?}");

    alice.end_call().await?;
    wait_for(&bob, CallState::Idle).await?;
    println!("📴 Call ended; Alice {:?}, Bob {:?}", alice.state(), bob.state());

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

async fn wait_for(service: &CallService, state: CallState) -> Result<()> {
    let mut rx = service.watch();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
        .await
        .with_context(|| format!("waiting for {state:?}"))??;
    Ok(())
}

fn generate_display_name() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        WORDS[rng.gen_range(0..WORDS.len())],
        WORDS[rng.gen_range(0..WORDS.len())]
    )
}
