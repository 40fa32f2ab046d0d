use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::error::LimeError;
use crate::transport::Transport;

/// In-memory duplex transport; each end of a [`PairTransport::pair`] talks to
/// the other. Used by tests and loopback channels.
pub struct PairTransport {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Envelope>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    closed: CancellationToken,
}

impl PairTransport {
    /// Builds both ends of a connected pair. Capacity bounds the number of
    /// in-flight envelopes per direction.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (Self::from_halves(a_tx, b_rx), Self::from_halves(b_tx, a_rx))
    }

    fn from_halves(tx: mpsc::Sender<Envelope>, rx: mpsc::Receiver<Envelope>) -> Self {
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Envelope>, LimeError> {
        self.tx
            .lock()
            .clone()
            .ok_or_else(|| LimeError::Transport("transport is closed".into()))
    }
}

#[async_trait]
impl Transport for PairTransport {
    async fn open(&self, _uri: &str) -> Result<(), LimeError> {
        // Pairs are born connected.
        Ok(())
    }

    async fn close(&self) -> Result<(), LimeError> {
        self.closed.cancel();
        // Dropping the sender wakes the peer's receive with a closed error;
        // closing our receiver (when nobody is blocked on it) rejects
        // further sends from the peer.
        self.tx.lock().take();
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), LimeError> {
        if self.closed.is_cancelled() {
            return Err(LimeError::Transport("transport is closed".into()));
        }
        let sender = self.sender()?;
        sender
            .send(envelope)
            .await
            .map_err(|_| LimeError::Transport("peer transport is closed".into()))
    }

    async fn receive(&self) -> Result<Envelope, LimeError> {
        let mut rx = self.rx.lock().await;
        // Buffered envelopes drain before the closed branch is taken.
        tokio::select! {
            biased;
            envelope = rx.recv() => {
                envelope.ok_or_else(|| LimeError::Transport("transport is closed".into()))
            }
            _ = self.closed.cancelled() => {
                Err(LimeError::Transport("transport is closed".into()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && self.tx.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Message, PlainText, TypedDocument};

    fn text_message(body: &str) -> Envelope {
        Envelope::Message(Message::fire_and_forget(
            "bob@example.org".parse().unwrap(),
            PlainText(body.into()).into_document().unwrap(),
        ))
    }

    #[tokio::test]
    async fn envelopes_cross_the_pair() {
        let (left, right) = PairTransport::pair(4);
        left.send(text_message("hello")).await.unwrap();
        let received = right.receive().await.unwrap();
        assert!(matches!(received, Envelope::Message(_)));
    }

    #[tokio::test]
    async fn closing_one_end_fails_the_peer() {
        let (left, right) = PairTransport::pair(4);
        left.close().await.unwrap();
        assert!(!left.is_connected());
        assert!(left.send(text_message("late")).await.is_err());
        assert!(right.receive().await.is_err());
        assert!(right.send(text_message("into the void")).await.is_err());
    }

    #[tokio::test]
    async fn buffered_envelopes_drain_after_peer_close() {
        let (left, right) = PairTransport::pair(4);
        left.send(text_message("first")).await.unwrap();
        left.close().await.unwrap();
        assert!(right.receive().await.is_ok());
        assert!(right.receive().await.is_err());
    }
}
