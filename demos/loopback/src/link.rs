//! In-memory link between an initiator and a responder.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use nearlink::prelude::*;

/// The simulated RF field. Every link created from it shares the exchange
/// counter, so drops stay periodic across reconnects.
#[derive(Debug)]
pub struct Field<H> {
    responder: Responder<H>,
    max_frame_size: usize,
    /// Drop the link every this many exchanges; 0 never drops.
    drop_every: u32,
    exchanges: Arc<AtomicU32>,
    drops: Arc<AtomicU32>,
}

impl<H: RequestHandler> Field<H> {
    /// Create a field in front of `responder`.
    pub fn new(responder: Responder<H>, max_frame_size: usize, drop_every: u32) -> Self {
        Self {
            responder,
            max_frame_size,
            drop_every,
            exchanges: Arc::new(AtomicU32::new(0)),
            drops: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Bring a reader into the field.
    pub fn link(&self) -> LoopbackLink<H> {
        LoopbackLink {
            responder: self.responder.clone(),
            max_frame_size: self.max_frame_size,
            drop_every: self.drop_every,
            exchanges: Arc::clone(&self.exchanges),
            drops: Arc::clone(&self.drops),
        }
    }

    /// Number of simulated link losses so far.
    pub fn drops(&self) -> u32 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// One reader-to-card link. Fails with an I/O error when the field drops.
#[derive(Debug)]
pub struct LoopbackLink<H> {
    responder: Responder<H>,
    max_frame_size: usize,
    drop_every: u32,
    exchanges: Arc<AtomicU32>,
    drops: Arc<AtomicU32>,
}

impl<H: RequestHandler> Channel for LoopbackLink<H> {
    fn transceive(&mut self, apdu: &[u8]) -> impl Future<Output = io::Result<Vec<u8>>> + Send {
        let count = self.exchanges.fetch_add(1, Ordering::Relaxed) + 1;
        let dropped = self.drop_every != 0 && count.is_multiple_of(self.drop_every);
        let responder = self.responder.clone();
        let drops = Arc::clone(&self.drops);
        let apdu = apdu.to_vec();

        async move {
            if !dropped {
                return Ok(responder.process(&apdu).await);
            }

            // Alternate between losing the command and losing the reply
            let nth = drops.fetch_add(1, Ordering::Relaxed);
            if nth % 2 == 1 {
                responder.process(&apdu).await;
            }
            responder.on_deactivated(DeactivationReason::LinkLoss).await;
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "field lost"))
        }
    }

    fn max_frame_size(&self) -> Option<usize> {
        Some(self.max_frame_size)
    }
}
