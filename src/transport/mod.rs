//! Frame-oriented duplex carriers of envelopes.
//!
//! Byte-level codecs (TCP, WebSocket) live outside the core; the crate ships
//! the in-memory [`PairTransport`] and the HTTP-emulated server transport.

use async_trait::async_trait;

use crate::envelope::{Envelope, SessionCompression, SessionEncryption};
use crate::error::LimeError;

mod pair;

pub use pair::PairTransport;

/// Duplex, frame-oriented envelope carrier.
///
/// `send` and `receive` may run concurrently on distinct tasks; concurrent
/// `send`s serialize inside the implementation. `set_encryption` and
/// `set_compression` are issued by the channel during negotiation and must
/// be atomic with respect to framing.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, uri: &str) -> Result<(), LimeError>;

    async fn close(&self) -> Result<(), LimeError>;

    async fn send(&self, envelope: Envelope) -> Result<(), LimeError>;

    async fn receive(&self) -> Result<Envelope, LimeError>;

    fn is_connected(&self) -> bool;

    /// Encryption modes this transport can apply, in preference order.
    fn supported_encryption(&self) -> Vec<SessionEncryption> {
        vec![SessionEncryption::None]
    }

    fn supported_compression(&self) -> Vec<SessionCompression> {
        vec![SessionCompression::None]
    }

    async fn set_encryption(&self, encryption: SessionEncryption) -> Result<(), LimeError> {
        if self.supported_encryption().contains(&encryption) {
            Ok(())
        } else {
            Err(LimeError::Transport(format!(
                "encryption {:?} not supported",
                encryption
            )))
        }
    }

    async fn set_compression(&self, compression: SessionCompression) -> Result<(), LimeError> {
        if self.supported_compression().contains(&compression) {
            Ok(())
        } else {
            Err(LimeError::Transport(format!(
                "compression {:?} not supported",
                compression
            )))
        }
    }
}
