//! Call mesh demo
//!
//! Runs several participants in one process. They share a `LocalHub` for
//! signaling and connect to each other with real WebRTC peer connections.
//! The first participant sends a text and a file; the demo exits once every
//! other participant has received both.
//!
//! # Usage
//!
//! ```bash
//! # Three participants, a generated 256 KiB file
//! cargo run --bin callmesh_demo -- --participants 3 --size 262144
//!
//! # Send a file from disk and log transfers to a backend
//! cargo run --bin callmesh_demo -- \
//!   --file ./notes.pdf \
//!   --backend-url http://localhost:3000
//! ```

use anyhow::{bail, Context};
use bytes::Bytes;
use callmesh::{
    transfer_log_from_config, CallTransports, FileMessage, FilePayload, LocalHub, LocalSession,
    MeshConfig, ReceivedMessage, TextMessage, Transport, WebRtcEngine, DEFAULT_CHUNK_SIZE,
};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Multi-party file transfer over WebRTC data channels
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of participants in the call
    #[arg(long, default_value_t = 3, env = "CALLMESH_PARTICIPANTS")]
    participants: usize,

    /// File to send (a generated file is sent when omitted)
    #[arg(long, env = "CALLMESH_FILE")]
    file: Option<PathBuf>,

    /// Size of the generated file in bytes
    #[arg(long, default_value_t = 256 * 1024, env = "CALLMESH_SIZE")]
    size: usize,

    /// Bytes per data channel chunk
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "CALLMESH_CHUNK_SIZE")]
    chunk_size: usize,

    /// STUN servers (comma-separated, empty for host candidates only)
    #[arg(long, value_delimiter = ',', env = "CALLMESH_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// Message log backend base URL
    #[arg(long, env = "CALLMESH_BACKEND_URL")]
    backend_url: Option<String>,

    /// Bearer token for the message log backend
    #[arg(long, env = "CALLMESH_BACKEND_TOKEN")]
    backend_token: Option<String>,

    /// Text message sent before the file
    #[arg(long, default_value = "hello from the demo", env = "CALLMESH_TEXT")]
    text: String,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 60, env = "CALLMESH_TIMEOUT")]
    timeout_secs: u64,
}

enum Delivery {
    Text { to: usize, text: String },
    File { to: usize, data: Bytes },
}

struct Participant {
    session: Arc<LocalSession>,
    transports: CallTransports,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    info!(
        version = callmesh::version(),
        participants = args.participants,
        chunk_size = args.chunk_size,
        "Call mesh demo starting"
    );

    if args.participants < 2 {
        bail!("need at least two participants");
    }

    let mut config = MeshConfig::default()
        .with_chunk_size(args.chunk_size)
        .with_stun_servers(args.stun_servers.clone());
    config.backend_url = args.backend_url.clone();
    config.backend_token = args.backend_token.clone();
    config.validate()?;

    let payload = load_payload(&args).await?;
    info!(
        name = %payload.name,
        size = payload.size(),
        "Prepared file"
    );

    let hub = LocalHub::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut participants = Vec::with_capacity(args.participants);

    for index in 0..args.participants {
        let session = hub.session(format!("con_{:02}", index));
        let transports = CallTransports::bind(
            session.clone(),
            Arc::new(WebRtcEngine::new(&config)),
            config.clone(),
            transfer_log_from_config(&config)?,
        )?;

        if index > 0 {
            let text_tx = tx.clone();
            transports
                .text()
                .on_received(Arc::new(move |message: ReceivedMessage<TextMessage>| {
                    let _ = text_tx.send(Delivery::Text {
                        to: index,
                        text: message.custom.text,
                    });
                }));

            let file_tx = tx.clone();
            transports
                .file()
                .on_received(Arc::new(move |message: ReceivedMessage<FileMessage>| {
                    let _ = file_tx.send(Delivery::File {
                        to: index,
                        data: message.custom.file.data,
                    });
                }));
        }

        participants.push(Participant {
            session,
            transports,
        });
    }
    drop(tx);

    for participant in &participants {
        participant.session.connect()?;
    }

    let sender = &participants[0].transports;
    sender.text().send(TextMessage::new(args.text.clone())).await?;
    sender.file().send(FileMessage::new(payload.clone())).await?;
    info!("Text sent, file queued until every peer is reachable");

    let expected = args.participants - 1;
    let wait = async {
        let mut texts = HashSet::new();
        let mut files = HashSet::new();
        while texts.len() < expected || files.len() < expected {
            match rx.recv().await {
                Some(Delivery::Text { to, text }) => {
                    if text != args.text {
                        bail!("participant {} got the wrong text", to);
                    }
                    info!("Participant {} received the text", to);
                    texts.insert(to);
                }
                Some(Delivery::File { to, data }) => {
                    if data != payload.data {
                        bail!("participant {} got a corrupted file", to);
                    }
                    info!("Participant {} received {} bytes", to, data.len());
                    files.insert(to);
                }
                None => bail!("receivers closed"),
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    let outcome = tokio::select! {
        result = tokio::time::timeout(Duration::from_secs(args.timeout_secs), wait) => {
            match result {
                Ok(inner) => inner,
                Err(_) => Err(anyhow::anyhow!("timed out after {}s", args.timeout_secs)),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl+C received, shutting down");
            Ok(())
        }
    };

    for participant in &participants {
        participant.transports.shutdown().await;
        participant.session.disconnect();
    }

    match &outcome {
        Ok(()) => info!("Demo finished"),
        Err(e) => error!("Demo failed: {:#}", e),
    }
    outcome
}

async fn load_payload(args: &Args) -> anyhow::Result<FilePayload> {
    match &args.file {
        Some(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            Ok(FilePayload::new(name, "application/octet-stream", data))
        }
        None => {
            let data: Vec<u8> = (0..args.size).map(|i| (i % 251) as u8).collect();
            Ok(FilePayload::new(
                "generated.bin",
                "application/octet-stream",
                data,
            ))
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("callmesh=info,callmesh_demo=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
