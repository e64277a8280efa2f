//! Interactive line-oriented demo for two or more hosts
//!
//! Start one instance per host, note the sentinel port each prints, then
//! connect them with `conn [host]:port`. Typed digits send a greeting on
//! that reliable lane, `u` sends one unreliable datagram, and a background
//! ticker keeps a trickle of traffic flowing on random lanes so the
//! duplicated paths stay busy.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Duration;

use koisyn::channel::{Channel, LaneIndex};
use koisyn::hooks::{AppContext, SessionHooks};
use koisyn::session::KoiSession;

#[derive(Parser)]
#[command(name = "koisyn-chat", about = "KoiSyn peer-to-peer demo")]
struct Args {
    /// UDP port to bind; 0 lets the OS choose
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Optional TOML file with `port` and a `peers` list to dial on start
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peers to dial on start, e.g. "[::1]:5001"
    #[arg(long)]
    connect: Vec<String>,

    /// Milliseconds between automatic chatter messages; 0 disables
    #[arg(long, default_value_t = 2000)]
    tick_ms: u64,
}

#[derive(Deserialize, Default)]
struct ChatConfig {
    port: Option<u16>,
    #[serde(default)]
    peers: Vec<String>,
}

/// Channel-local state the demo attaches to every accepted peer.
struct PeerTag {
    label: String,
}

struct ChatHooks {
    peers: Mutex<Vec<(Channel, AppContext)>>,
}

impl ChatHooks {
    fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
        }
    }

    async fn channels(&self) -> Vec<Channel> {
        self.peers
            .lock()
            .await
            .iter()
            .map(|(channel, _)| channel.clone())
            .collect()
    }
}

fn label_of(context: &dyn Any) -> &str {
    context
        .downcast_ref::<PeerTag>()
        .map(|tag| tag.label.as_str())
        .unwrap_or("?")
}

#[async_trait]
impl SessionHooks for ChatHooks {
    async fn on_accept(&self, channel: Channel) -> Option<AppContext> {
        let mut peers = self.peers.lock().await;
        let tag: AppContext = Arc::new(PeerTag {
            label: format!("peer-{}", peers.len()),
        });
        tracing::info!("accepted {channel}");
        // the session only keeps a weak reference; the strong one lives here
        peers.push((channel, tag.clone()));
        Some(tag)
    }

    async fn on_reliable(
        &self,
        channel: Channel,
        lane: LaneIndex,
        data: Bytes,
        context: AppContext,
    ) {
        tracing::info!(
            "{} ({channel}) lane {lane}: {}",
            label_of(context.as_ref()),
            String::from_utf8_lossy(&data)
        );
    }

    async fn on_unreliable(&self, channel: Channel, data: Bytes, context: AppContext) {
        tracing::info!(
            "{} ({channel}) unreliable: {}",
            label_of(context.as_ref()),
            String::from_utf8_lossy(&data)
        );
    }

    async fn on_disconnect(&self, channel: Channel, _context: Option<AppContext>) {
        tracing::info!("{channel} disconnected");
        self.peers.lock().await.retain(|(other, _)| *other != channel);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => toml::from_str::<ChatConfig>(&std::fs::read_to_string(path)?)?,
        None => ChatConfig::default(),
    };

    let port = if args.port != 0 {
        args.port
    } else {
        config.port.unwrap_or(0)
    };

    let hooks = Arc::new(ChatHooks::new());
    let session = KoiSession::start(hooks.clone(), port)
        .await
        .map_err(|e| anyhow::anyhow!("session start failed: {e}"))?;

    println!("sentinel port: {}", session.sentinel_port());
    println!("commands: conn <addr>   dial a peer, e.g. conn [::1]:5001");
    println!("          0|1|2|3       send a greeting on that reliable lane");
    println!("          u             send one unreliable datagram");
    println!("          quit          shut down");

    for peer in config.peers.iter().chain(&args.connect) {
        session.connect_to(peer, 0).await;
    }

    if args.tick_ms != 0 {
        let hooks = hooks.clone();
        let tick = Duration::from_millis(args.tick_ms);
        tokio::spawn(async move {
            let mut counter = 0u64;
            loop {
                tokio::time::sleep(tick).await;
                let lane = LaneIndex::new(rand::random_range(0..LaneIndex::COUNT))
                    .expect("lane in range");
                let message = format!("hello, world! {:02}", counter % 100);
                for channel in hooks.channels().await {
                    if channel.reliable_send(lane, message.as_bytes()).await {
                        tracing::debug!("sent to {channel} lane {lane}: {message}");
                    }
                }
                counter += 1;
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "quit" => break,
            "u" => {
                for channel in hooks.channels().await {
                    channel.unreliable_send(b"hello, world!").await;
                }
            }
            "0" | "1" | "2" | "3" => {
                let lane = LaneIndex::new(line.parse().unwrap()).expect("lane in range");
                for channel in hooks.channels().await {
                    channel.reliable_send(lane, b"hello, world!").await;
                }
            }
            _ => {
                if let Some(endpoint) = line.strip_prefix("conn ") {
                    session.connect_to(endpoint.trim(), 0).await;
                } else if !line.is_empty() {
                    println!("unknown command: {line}");
                }
            }
        }
    }

    for channel in hooks.channels().await {
        channel.disconnect().await;
    }
    session.shutdown().await;
    Ok(())
}
