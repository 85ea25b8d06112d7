//! NEARLINK Loopback Demo
//!
//! Runs an initiator against a responder over an in-memory link that drops
//! periodically, exercising fragmentation, resumption and deferred replies.
//! The responder answers every request with its bytes reversed.
//!
//! Environment variables:
//! - NEARLINK_MESSAGES: number of messages to exchange (default 3)
//! - NEARLINK_PAYLOAD_SIZE: bytes per message (default 1024)
//! - NEARLINK_FRAME_SIZE: frame size the link carries (default 64)
//! - NEARLINK_DROP_EVERY: drop the link every N exchanges, 0 = never (default 7)
//! - NEARLINK_DEFER: "1" to answer through `send_later` instead of inline
//! - RUST_LOG: log filter (default info)

mod link;
mod logging;

use std::env;
use std::str::FromStr;
use std::time::Duration;

use nearlink::prelude::*;
use tokio::sync::mpsc;

use link::Field;

/// Reconnect attempts per message before giving up.
const MAX_RECONNECTS: u32 = 16;

/// Demo settings read from the environment.
#[derive(Debug, Clone)]
struct Settings {
    messages: usize,
    payload_size: usize,
    frame_size: usize,
    drop_every: u32,
    defer: bool,
}

impl Settings {
    fn from_env() -> nearlink::Result<Self> {
        Ok(Self {
            messages: var("NEARLINK_MESSAGES", 3)?,
            payload_size: var("NEARLINK_PAYLOAD_SIZE", 1024)?,
            frame_size: var("NEARLINK_FRAME_SIZE", 64)?,
            drop_every: var("NEARLINK_DROP_EVERY", 7)?,
            defer: env::var("NEARLINK_DEFER").is_ok_and(|v| v == "1"),
        })
    }
}

fn var<T: FromStr>(name: &str, default: T) -> nearlink::Result<T> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ProtocolError::Config(format!("{name}: invalid value {value:?}"))),
        Err(_) => Ok(default),
    }
}

fn reversed(request: &[u8]) -> Vec<u8> {
    request.iter().rev().copied().collect()
}

/// Transceive `payload`, reconnecting and resuming across link drops.
async fn exchange<H: RequestHandler>(
    initiator: &mut Initiator<link::LoopbackLink<H>>,
    field: &Field<H>,
    payload: &[u8],
) -> nearlink::Result<Vec<u8>> {
    let mut result = initiator.transceive(payload).await;

    for _ in 0..MAX_RECONNECTS {
        match result {
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "link dropped, reconnecting");
                result = match initiator.enable(field.link()).await {
                    Ok(Handshake::Resumed) => initiator.resume().await,
                    Ok(Handshake::Fresh) => initiator.transceive(payload).await,
                    Err(e) => Err(e),
                };
            }
            other => return other,
        }
    }
    result
}

#[tokio::main]
async fn main() -> nearlink::Result<()> {
    logging::init();
    let settings = Settings::from_env()?;
    tracing::info!(?settings, "starting loopback");

    let config = SessionConfigBuilder::new()
        .max_frame_size(settings.frame_size)
        .max_retransmits(2)
        .resume_threshold(Duration::from_millis(300))
        .build()?;

    // Deferred mode hands requests to a worker that answers via send_later
    let (work_tx, mut work_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let defer = settings.defer;
    let handler = move |request: &[u8]| -> Option<Vec<u8>> {
        if !defer {
            return Some(reversed(request));
        }
        if work_tx.send(request.to_vec()).is_err() {
            tracing::warn!("worker gone, answering immediately");
            return Some(reversed(request));
        }
        None
    };

    let (responder, mut responder_events) = Responder::new(handler, config.clone());
    let worker = responder.clone();
    tokio::spawn(async move {
        while let Some(request) = work_rx.recv().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Err(e) = worker.send_later(reversed(&request)).await {
                tracing::warn!(error = %e, "deferred response rejected");
            }
        }
    });
    tokio::spawn(async move {
        while let Some(event) = responder_events.recv().await {
            log_event("responder", &event);
        }
    });

    let field = Field::new(responder, settings.frame_size, settings.drop_every);
    let (mut initiator, mut initiator_events) = Initiator::new(InitiatorConfig {
        session_id: 0x4E4C_4E4B,
        session: config,
    });
    tokio::spawn(async move {
        while let Some(event) = initiator_events.recv().await {
            log_event("initiator", &event);
        }
    });

    let mut handshake = initiator.enable(field.link()).await;
    for _ in 0..MAX_RECONNECTS {
        match handshake {
            Err(e) if e.is_transient() => handshake = initiator.enable(field.link()).await,
            _ => break,
        }
    }
    handshake?;

    for n in 0..settings.messages {
        let payload: Vec<u8> = (0..settings.payload_size).map(|i| (i + n) as u8).collect();
        let response = exchange(&mut initiator, &field, &payload).await?;
        if response != reversed(&payload) {
            return Err(ProtocolError::PeerError(format!("message {n}: response mismatch")));
        }
        tracing::info!(
            message = n,
            bytes = response.len(),
            fragments = fragment_count(payload.len(), settings.frame_size),
            "exchange verified"
        );
    }

    tracing::info!(drops = field.drops(), "loopback complete");
    initiator.disable().await;
    Ok(())
}

fn log_event(role: &'static str, event: &SessionEvent) {
    match event {
        SessionEvent::MessageReceived(bytes) => {
            tracing::debug!(role, len = bytes.len(), "message received")
        }
        SessionEvent::FatalError { kind, detail } => {
            tracing::error!(role, ?kind, %detail, "fatal error")
        }
        other => tracing::info!(role, event = ?other, "session event"),
    }
}
