//! High-level initiator API.
//!
//! Provides [`Initiator<C>`], which drives the exchange loop over a
//! [`Channel`] and reports session events to the application.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{self, Instant};

use crate::core::constants::{MIN_FRAME_SIZE, PROTOCOL_VERSION};
use crate::core::{Channel, FrameError, InitiatorConfig, ProtocolError, Result};
use crate::session::{EventSink, EventStream, SessionEvent, Watchdog};
use crate::transport::{Frame, SessionParams};

use super::machine::{Handshake, InitiatorMachine, Step, check_select_ack, handshake_outcome};

/// Lifecycle phase of an initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorPhase {
    /// No usable channel.
    Idle,
    /// Handshake in progress.
    Handshaking,
    /// Session established.
    Active,
    /// Session torn down by a fatal error or connection loss.
    Failed,
}

/// State shared with the watchdog task.
#[derive(Debug)]
struct Shared {
    machine: Option<InitiatorMachine>,
    phase: InitiatorPhase,
    /// Bumped whenever a session ends, so a stale watchdog cannot discard its successor.
    generation: u64,
}

/// Card-reader side of a NEARLINK session.
///
/// # Example
///
/// ```ignore
/// use nearlink::prelude::*;
///
/// let (mut initiator, mut events) = Initiator::new(InitiatorConfig::new(0x5EED));
/// initiator.enable(reader).await?;
///
/// let response = initiator.transceive(b"hello").await?;
/// ```
#[derive(Debug)]
pub struct Initiator<C> {
    /// Initiator configuration.
    config: InitiatorConfig,

    /// Bound channel, if any.
    channel: Option<C>,

    /// Session state, shared with the watchdog.
    shared: Arc<Mutex<Shared>>,

    /// Inactivity watchdog for the current transceive.
    watchdog: Option<Watchdog>,

    /// Event delivery.
    events: EventSink,

    /// The last transceive stopped on a channel error.
    interrupted: bool,
}

impl<C: Channel> Initiator<C> {
    /// Create an initiator.
    ///
    /// Returns the initiator and the stream of session events.
    pub fn new(config: InitiatorConfig) -> (Self, EventStream) {
        let (events, stream) = EventSink::channel();
        let initiator = Self {
            config,
            channel: None,
            shared: Arc::new(Mutex::new(Shared {
                machine: None,
                phase: InitiatorPhase::Idle,
                generation: 0,
            })),
            watchdog: None,
            events,
            interrupted: false,
        };
        (initiator, stream)
    }

    /// Bind a channel and perform the handshake.
    ///
    /// Offers to resume if the previous transceive was interrupted by a
    /// channel error and its watchdog has not fired yet.
    pub async fn enable(&mut self, channel: C) -> Result<Handshake> {
        let configured = self.config.session.max_frame_size;
        let max_frame_size = channel
            .max_frame_size()
            .map_or(configured, |limit| limit.min(configured));
        if max_frame_size < MIN_FRAME_SIZE {
            return Err(ProtocolError::Config(format!(
                "channel frame size {max_frame_size} below minimum {MIN_FRAME_SIZE}"
            )));
        }

        self.channel = Some(channel);
        self.set_phase(InitiatorPhase::Handshaking).await;

        match self.handshake(max_frame_size).await {
            Ok(handshake) => Ok(handshake),
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "initiator: handshake interrupted");
                self.channel = None;
                self.set_phase(InitiatorPhase::Idle).await;
                Err(e)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Send `payload` and wait for the complete response.
    pub async fn transceive(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        if self.channel.is_none() {
            return Err(ProtocolError::NotConnected);
        }

        let first = {
            let mut shared = self.shared.lock().await;
            if shared.phase != InitiatorPhase::Active {
                return Err(ProtocolError::NotConnected);
            }
            let machine = shared.machine.as_mut().ok_or(ProtocolError::NotConnected)?;
            if machine.in_flight() {
                return Err(ProtocolError::ExchangePending);
            }
            machine.begin(payload)
        };

        self.arm_watchdog().await;
        self.drive(first).await
    }

    /// Finish an exchange interrupted by a channel error.
    ///
    /// Call after [`enable`](Self::enable) returned [`Handshake::Resumed`].
    pub async fn resume(&mut self) -> Result<Vec<u8>> {
        let frame = {
            let shared = self.shared.lock().await;
            if shared.phase != InitiatorPhase::Active {
                return Err(ProtocolError::NotConnected);
            }
            shared
                .machine
                .as_ref()
                .and_then(InitiatorMachine::resume_frame)
                .ok_or(ProtocolError::NotConnected)?
        };

        tracing::debug!(seq = frame.sequence, "initiator: resuming exchange");
        self.arm_watchdog().await;
        self.drive(frame).await
    }

    /// Release the channel and discard the session.
    pub async fn disable(&mut self) {
        self.cancel_watchdog();
        {
            let mut shared = self.shared.lock().await;
            shared.machine = None;
            shared.phase = InitiatorPhase::Idle;
            shared.generation += 1;
        }
        self.channel = None;
        self.interrupted = false;
        tracing::info!("initiator: disabled");
    }

    /// Get the current lifecycle phase.
    pub async fn phase(&self) -> InitiatorPhase {
        self.shared.lock().await.phase
    }

    /// Check if an interrupted exchange is waiting for [`resume`](Self::resume).
    pub async fn has_pending_exchange(&self) -> bool {
        self.shared
            .lock()
            .await
            .machine
            .as_ref()
            .is_some_and(InitiatorMachine::in_flight)
    }

    /// Get the configured session identifier.
    pub fn session_id(&self) -> u64 {
        self.config.session_id
    }

    async fn handshake(&mut self, max_frame_size: usize) -> Result<Handshake> {
        let ack = self
            .exchange(&Frame::channel_select())
            .await?
            .map_err(|e| ProtocolError::HandshakeFailed(format!("corrupt select acknowledgement: {e}")))?;
        check_select_ack(&ack)?;
        self.touch();

        let watchdog_alive = self.watchdog.as_ref().is_some_and(Watchdog::is_active);
        let (params, offer_resume) = {
            let shared = self.shared.lock().await;
            match &shared.machine {
                Some(machine) if self.interrupted && watchdog_alive => (machine.session_params(), true),
                _ => (
                    SessionParams {
                        session_id: self.config.session_id,
                        max_frame_size: u16::try_from(max_frame_size).unwrap_or(u16::MAX),
                    },
                    false,
                ),
            }
        };
        tracing::debug!(
            session_id = params.session_id,
            max_frame_size = params.max_frame_size,
            resume = offer_resume,
            "initiator: sending session id"
        );

        let reply = self
            .exchange(&Frame::session_id(params, offer_resume))
            .await?
            .map_err(|e| ProtocolError::HandshakeFailed(format!("corrupt session reply: {e}")))?;
        if reply.version > PROTOCOL_VERSION {
            return Err(ProtocolError::VersionIncompatible {
                supported: PROTOCOL_VERSION,
                received: reply.version,
            });
        }
        let handshake = handshake_outcome(&reply, offer_resume)?;
        self.touch();

        if handshake == Handshake::Fresh {
            self.cancel_watchdog();
        }
        {
            let mut shared = self.shared.lock().await;
            if handshake == Handshake::Fresh {
                if shared.machine.as_ref().is_some_and(InitiatorMachine::in_flight) {
                    tracing::warn!("initiator: peer declined resume, interrupted exchange abandoned");
                }
                shared.machine = Some(InitiatorMachine::new(
                    params.session_id,
                    &self.config.session,
                    usize::from(params.max_frame_size),
                ));
                shared.generation += 1;
            }
            shared.phase = InitiatorPhase::Active;
        }
        self.interrupted = false;

        let resumed = handshake == Handshake::Resumed;
        tracing::info!(session_id = params.session_id, resumed, "initiator: session established");
        self.events.emit(SessionEvent::SessionInitialized {
            session_id: params.session_id,
            resumed,
        });
        Ok(handshake)
    }

    /// Exchange frames until the response completes or the session fails.
    async fn drive(&mut self, mut frame: Frame) -> Result<Vec<u8>> {
        let generation = self.shared.lock().await.generation;
        loop {
            let reply = match self.exchange(&frame).await {
                Ok(reply) => reply,
                Err(e) => return Err(self.exchange_failed(generation, frame.sequence, e).await),
            };
            self.touch();

            let step = {
                let mut shared = self.shared.lock().await;
                let Some(machine) = shared.machine.as_mut() else {
                    return Err(ProtocolError::ConnectionLost("session expired".into()));
                };
                let step = machine.on_reply(reply, Instant::now());
                if machine.take_delivered() {
                    self.events.emit(SessionEvent::MessageSent);
                }
                if matches!(step, Step::Complete(_)) {
                    machine.finish();
                }
                step
            };

            match step {
                Step::Continue(next) | Step::Retransmit(next) => frame = next,
                Step::Complete(response) => {
                    self.cancel_watchdog();
                    tracing::debug!(len = response.len(), "initiator: transceive complete");
                    self.events.emit(SessionEvent::MessageReceived(response.clone()));
                    return Ok(response);
                }
                Step::Fatal(e) => return Err(self.fail(e).await),
            }
        }
    }

    /// Settle the session after a failed exchange inside [`drive`](Self::drive).
    async fn exchange_failed(&mut self, generation: u64, seq: u8, error: ProtocolError) -> ProtocolError {
        if self.shared.lock().await.generation != generation {
            // The watchdog already tore the session down and reported it
            tracing::debug!(error = %error, "initiator: exchange ended after session loss");
            self.cancel_watchdog();
            self.channel = None;
            self.interrupted = false;
            return error;
        }
        if error.is_transient() {
            tracing::warn!(error = %error, seq, "initiator: channel error, awaiting resume");
            self.interrupted = true;
            self.channel = None;
            self.set_phase(InitiatorPhase::Idle).await;
            return error;
        }
        self.fail(error).await
    }

    /// One physical exchange, bounded by the exchange timeout.
    async fn exchange(&mut self, frame: &Frame) -> Result<std::result::Result<Frame, FrameError>> {
        let timeout = self.config.session.exchange_timeout;
        let channel = self.channel.as_mut().ok_or(ProtocolError::NotConnected)?;

        let apdu = frame.encode();
        tracing::trace!(seq = frame.sequence, frame_type = ?frame.frame_type, bytes = ?apdu, "initiator: >>");

        let reply = match time::timeout(timeout, channel.transceive(&apdu)).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(ProtocolError::ConnectionLost(format!(
                    "no reply within {timeout:?}"
                )));
            }
        };
        tracing::trace!(bytes = ?reply, "initiator: <<");

        Ok(Frame::decode(&reply))
    }

    /// Tear the session down and report `error`.
    async fn fail(&mut self, error: ProtocolError) -> ProtocolError {
        self.cancel_watchdog();
        {
            let mut shared = self.shared.lock().await;
            shared.machine = None;
            shared.phase = InitiatorPhase::Failed;
            shared.generation += 1;
        }
        self.interrupted = false;

        tracing::error!(error = %error, kind = ?error.kind(), "initiator: session failed");
        self.events.emit(SessionEvent::fatal(&error));
        error
    }

    /// Start a watchdog unless one is already running.
    async fn arm_watchdog(&mut self) {
        if self.watchdog.as_ref().is_some_and(Watchdog::is_active) {
            return;
        }

        let generation = self.shared.lock().await.generation;
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();

        self.watchdog = Some(Watchdog::arm(
            self.config.session.resume_threshold,
            move || async move {
                let mut shared = shared.lock().await;
                if shared.generation != generation || shared.machine.is_none() {
                    return;
                }
                shared.machine = None;
                shared.phase = InitiatorPhase::Failed;
                shared.generation += 1;
                tracing::info!("initiator: connection lost");
                events.emit(SessionEvent::ConnectionLost);
            },
        ));
    }

    fn touch(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.touch();
        }
    }

    fn cancel_watchdog(&mut self) {
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
    }

    async fn set_phase(&self, phase: InitiatorPhase) {
        self.shared.lock().await.phase = phase;
    }
}
