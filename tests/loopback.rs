//! End-to-end tests: a real initiator talking to a real responder over an
//! in-memory link that can lose, corrupt or interleave exchanges.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nearlink::core::constants::KEEP_ALIVE_PROBE;
use nearlink::prelude::*;

/// What happens to one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    /// The command never reaches the card.
    LoseCommand,
    /// The card processes the command but the reply is lost.
    LoseReply,
    /// The command arrives truncated.
    CorruptCommand,
    /// The reply arrives truncated.
    CorruptReply,
    /// The reader injects a keep-alive probe first.
    KeepAliveFirst,
}

struct Link<H> {
    responder: Responder<H>,
    max_frame_size: usize,
    fault: fn(u32) -> Fault,
    count: u32,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl<H: RequestHandler> Link<H> {
    fn new(responder: &Responder<H>, max_frame_size: usize, fault: fn(u32) -> Fault) -> Self {
        Self {
            responder: responder.clone(),
            max_frame_size,
            fault,
            count: 0,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

fn clean(_: u32) -> Fault {
    Fault::None
}

impl<H: RequestHandler> Channel for Link<H> {
    fn transceive(&mut self, apdu: &[u8]) -> impl Future<Output = io::Result<Vec<u8>>> + Send {
        self.count += 1;
        let fault = (self.fault)(self.count);
        let responder = self.responder.clone();
        let mut apdu = apdu.to_vec();
        self.sent.lock().unwrap().push(apdu.clone());

        async move {
            tokio::task::yield_now().await;
            match fault {
                Fault::None => Ok(responder.process(&apdu).await),
                Fault::LoseCommand => {
                    responder.on_deactivated(DeactivationReason::LinkLoss).await;
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "field lost"))
                }
                Fault::LoseReply => {
                    responder.process(&apdu).await;
                    responder.on_deactivated(DeactivationReason::LinkLoss).await;
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "field lost"))
                }
                Fault::CorruptCommand => {
                    apdu.truncate(1);
                    Ok(responder.process(&apdu).await)
                }
                Fault::CorruptReply => {
                    let mut reply = responder.process(&apdu).await;
                    reply.truncate(1);
                    Ok(reply)
                }
                Fault::KeepAliveFirst => {
                    let ack = responder.process(&KEEP_ALIVE_PROBE).await;
                    assert_eq!(ack, Frame::keep_alive_ack().encode());
                    Ok(responder.process(&apdu).await)
                }
            }
        }
    }

    fn max_frame_size(&self) -> Option<usize> {
        Some(self.max_frame_size)
    }
}

fn reverse(request: &[u8]) -> Option<Vec<u8>> {
    Some(request.iter().rev().copied().collect())
}

fn initiator_config(session_id: u64) -> InitiatorConfig {
    InitiatorConfig::new(session_id)
}

fn drain(events: &mut EventStream) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_small_message_round_trip() {
    let (responder, mut responder_events) = Responder::new(reverse, SessionConfig::default());
    let (mut initiator, mut initiator_events) = Initiator::new(initiator_config(1));

    assert_eq!(
        initiator.enable(Link::new(&responder, 245, clean)).await.unwrap(),
        Handshake::Fresh
    );
    assert_eq!(initiator.transceive(b"abc").await.unwrap(), b"cba".to_vec());

    assert_eq!(
        drain(&mut initiator_events),
        vec![
            SessionEvent::SessionInitialized { session_id: 1, resumed: false },
            SessionEvent::MessageSent,
            SessionEvent::MessageReceived(b"cba".to_vec()),
        ]
    );
    assert_eq!(
        drain(&mut responder_events),
        vec![
            SessionEvent::SessionInitialized { session_id: 1, resumed: false },
            SessionEvent::MessageReceived(b"abc".to_vec()),
            SessionEvent::MessageSent,
        ]
    );
}

#[tokio::test]
async fn test_sequence_wraparound_over_many_fragments() {
    let (responder, _events) = Responder::new(reverse, SessionConfig::default());
    let (mut initiator, _events) = Initiator::new(initiator_config(2));

    // One payload byte per frame
    let link = Link::new(&responder, 3, clean);
    let sent = Arc::clone(&link.sent);
    initiator.enable(link).await.unwrap();

    let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    let response = initiator.transceive(&payload).await.unwrap();
    assert_eq!(response, reverse(&payload).unwrap());

    let sequences: Vec<u8> = sent.lock().unwrap()[2..]
        .iter()
        .map(|apdu| Frame::decode(apdu).unwrap().sequence)
        .collect();
    assert_eq!(sequences.len(), 600 + 599);
    assert!(sequences.iter().all(|s| (1..=254).contains(s)));
    assert!(sequences.windows(2).any(|w| w == [254, 1]));
}

#[tokio::test]
async fn test_resume_after_lost_reply() {
    let (responder, mut responder_events) = Responder::new(reverse, SessionConfig::default());
    let (mut initiator, _events) = Initiator::new(initiator_config(3));

    fn lose_fourth(n: u32) -> Fault {
        if n == 4 { Fault::LoseReply } else { Fault::None }
    }
    initiator.enable(Link::new(&responder, 245, lose_fourth)).await.unwrap();
    assert_eq!(initiator.transceive(b"one").await.unwrap(), b"eno".to_vec());

    let err = initiator.transceive(b"two").await.unwrap_err();
    assert!(err.is_transient());
    assert!(initiator.has_pending_exchange().await);

    assert_eq!(
        initiator.enable(Link::new(&responder, 245, clean)).await.unwrap(),
        Handshake::Resumed
    );
    assert_eq!(initiator.resume().await.unwrap(), b"owt".to_vec());
    assert_eq!(initiator.transceive(b"three").await.unwrap(), b"eerht".to_vec());

    // The replayed reply did not run the handler twice
    let received: Vec<_> = drain(&mut responder_events)
        .into_iter()
        .filter(|e| *e == SessionEvent::MessageReceived(b"two".to_vec()))
        .collect();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn test_resume_after_lost_command() {
    let (responder, _events) = Responder::new(reverse, SessionConfig::default());
    let (mut initiator, _events) = Initiator::new(initiator_config(4));

    fn lose_third(n: u32) -> Fault {
        if n == 3 { Fault::LoseCommand } else { Fault::None }
    }
    initiator.enable(Link::new(&responder, 8, lose_third)).await.unwrap();
    assert!(initiator.transceive(b"fragmented request").await.is_err());

    assert_eq!(
        initiator.enable(Link::new(&responder, 8, clean)).await.unwrap(),
        Handshake::Resumed
    );
    assert_eq!(initiator.resume().await.unwrap(), b"tseuqer detnemgarf".to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_fresh_session_after_resume_window() {
    let (responder, mut responder_events) = Responder::new(reverse, SessionConfig::default());
    let (mut initiator, mut initiator_events) = Initiator::new(initiator_config(5));

    fn lose_third(n: u32) -> Fault {
        if n == 3 { Fault::LoseReply } else { Fault::None }
    }
    initiator.enable(Link::new(&responder, 245, lose_third)).await.unwrap();
    assert!(initiator.transceive(b"late").await.is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;
    tokio::task::yield_now().await;

    assert!(drain(&mut initiator_events).contains(&SessionEvent::ConnectionLost));
    assert!(drain(&mut responder_events).contains(&SessionEvent::ConnectionLost));
    assert_eq!(responder.session_id().await, None);

    assert_eq!(
        initiator.enable(Link::new(&responder, 245, clean)).await.unwrap(),
        Handshake::Fresh
    );
    assert!(!initiator.has_pending_exchange().await);
    assert_eq!(initiator.transceive(b"again").await.unwrap(), b"niaga".to_vec());
}

#[tokio::test]
async fn test_other_session_id_starts_fresh() {
    let (responder, mut responder_events) = Responder::new(reverse, SessionConfig::default());
    let (mut first, _events) = Initiator::new(initiator_config(6));
    let (mut second, _events) = Initiator::new(initiator_config(7));

    fn lose_third(n: u32) -> Fault {
        if n == 3 { Fault::LoseReply } else { Fault::None }
    }
    first.enable(Link::new(&responder, 245, lose_third)).await.unwrap();
    assert!(first.transceive(b"interrupted").await.is_err());

    second.enable(Link::new(&responder, 245, clean)).await.unwrap();
    assert_eq!(responder.session_id().await, Some(7));
    assert_eq!(second.transceive(b"mine").await.unwrap(), b"enim".to_vec());

    // The first reader comes back but its session is gone
    assert_eq!(
        first.enable(Link::new(&responder, 245, clean)).await.unwrap(),
        Handshake::Fresh
    );
    assert!(!first.has_pending_exchange().await);
    assert_eq!(responder.session_id().await, Some(6));

    let initialized: Vec<_> = drain(&mut responder_events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::SessionInitialized { resumed: false, .. }))
        .collect();
    assert_eq!(initialized.len(), 3);
}

#[tokio::test]
async fn test_corruption_is_repaired_by_retransmit() {
    let (responder, _events) = Responder::new(reverse, SessionConfig::default());
    let (mut initiator, mut events) = Initiator::new(initiator_config(8));

    fn corrupt(n: u32) -> Fault {
        match n {
            3 => Fault::CorruptReply,
            5 => Fault::CorruptCommand,
            _ => Fault::None,
        }
    }
    initiator.enable(Link::new(&responder, 245, corrupt)).await.unwrap();

    assert_eq!(initiator.transceive(b"first").await.unwrap(), b"tsrif".to_vec());
    assert_eq!(initiator.transceive(b"second").await.unwrap(), b"dnoces".to_vec());
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::FatalError { .. })));
}

#[tokio::test]
async fn test_keep_alive_probe_between_exchanges() {
    let (responder, _events) = Responder::new(reverse, SessionConfig::default());
    let (mut initiator, _events) = Initiator::new(initiator_config(9));

    fn probe(n: u32) -> Fault {
        if n.is_multiple_of(2) { Fault::KeepAliveFirst } else { Fault::None }
    }
    initiator.enable(Link::new(&responder, 6, probe)).await.unwrap();
    assert_eq!(
        initiator.transceive(b"probed payload").await.unwrap(),
        b"daolyap deborp".to_vec()
    );
}

#[tokio::test]
async fn test_deferred_response_with_polling() {
    let (work_tx, mut work_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
    let handler = move |request: &[u8]| -> Option<Vec<u8>> {
        work_tx.send(request.to_vec()).unwrap();
        None
    };
    let (responder, mut responder_events) = Responder::new(handler, SessionConfig::default());

    let worker = responder.clone();
    tokio::spawn(async move {
        while let Some(request) = work_rx.recv().await {
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            worker.send_later(reverse(&request).unwrap()).await.unwrap();
        }
    });

    let (mut initiator, _events) = Initiator::new(initiator_config(10));
    initiator.enable(Link::new(&responder, 8, clean)).await.unwrap();
    assert_eq!(
        initiator.transceive(b"take your time").await.unwrap(),
        b"emit ruoy ekat".to_vec()
    );
    assert!(!responder.is_awaiting_response().await);
    assert!(drain(&mut responder_events).contains(&SessionEvent::MessageSent));
}

#[tokio::test]
async fn test_disable_discards_session() {
    let (responder, _events) = Responder::new(reverse, SessionConfig::default());
    let (mut initiator, _events) = Initiator::new(initiator_config(11));

    initiator.enable(Link::new(&responder, 245, clean)).await.unwrap();
    initiator.disable().await;
    assert_eq!(initiator.phase().await, InitiatorPhase::Idle);
    assert!(matches!(
        initiator.transceive(b"x").await,
        Err(ProtocolError::NotConnected)
    ));

    assert_eq!(
        initiator.enable(Link::new(&responder, 245, clean)).await.unwrap(),
        Handshake::Fresh
    );
}
