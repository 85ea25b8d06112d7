//! Collaborator traits for NEARLINK.
//!
//! The protocol engine does not own the radio or the application. It talks to
//! the physical link through [`Channel`] and, on the card side, hands complete
//! requests to a [`RequestHandler`].

use std::future::Future;
use std::io;

/// A half-duplex request/response link (reader, radio, OS card-emulation service).
///
/// One call is one physical exchange: the initiator sends `apdu` and the peer's
/// reply is returned. Errors are treated as possibly transient link drops.
///
/// # Example
///
/// ```ignore
/// struct Reader { tag: IsoDep }
///
/// impl Channel for Reader {
///     async fn transceive(&mut self, apdu: &[u8]) -> io::Result<Vec<u8>> {
///         self.tag.transceive(apdu).await
///     }
///
///     fn max_frame_size(&self) -> Option<usize> {
///         Some(self.tag.max_transceive_length())
///     }
/// }
/// ```
pub trait Channel: Send {
    /// Send `apdu` and wait for the peer's reply.
    fn transceive(&mut self, apdu: &[u8]) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    /// Largest frame the link can carry per exchange.
    ///
    /// Returns `None` if the link does not constrain the configured size.
    fn max_frame_size(&self) -> Option<usize> {
        None
    }
}

/// Application side of the responder.
///
/// Called with every fully reassembled request.
pub trait RequestHandler: Send + 'static {
    /// Handle a request.
    ///
    /// Returns `Some(response)` to reply immediately, or `None` to defer; the
    /// response must then be supplied later through `Responder::send_later`.
    fn handle(&mut self, request: &[u8]) -> Option<Vec<u8>>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    fn handle(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        self(request)
    }
}
