//! Per-identity storage of undelivered envelopes.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::envelope::{Envelope, EnvelopeId, Identity};
use crate::error::LimeError;

/// Queue of undelivered envelopes keyed by recipient identity.
///
/// Ordering within a recipient's queue follows insertion order; delivery is
/// at most once (a deleted envelope is gone).
#[async_trait]
pub trait EnvelopeStorage: Send + Sync {
    /// Appends an envelope to the recipient's queue. The envelope must carry
    /// an id.
    async fn store(&self, identity: &Identity, envelope: Envelope) -> Result<(), LimeError>;

    /// Snapshot of the stored ids for the identity, oldest first.
    async fn get_ids(&self, identity: &Identity) -> Result<Vec<EnvelopeId>, LimeError>;

    async fn get(
        &self,
        identity: &Identity,
        id: &EnvelopeId,
    ) -> Result<Option<Envelope>, LimeError>;

    /// Removes the envelope; `false` when it was not present.
    async fn delete(&self, identity: &Identity, id: &EnvelopeId) -> Result<bool, LimeError>;
}

type Queue = Arc<parking_lot::Mutex<Vec<(EnvelopeId, Envelope)>>>;

/// In-memory storage with per-identity locking.
#[derive(Default)]
pub struct InMemoryEnvelopeStorage {
    queues: DashMap<Identity, Queue>,
}

impl InMemoryEnvelopeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, identity: &Identity) -> Queue {
        self.queues
            .entry(identity.clone())
            .or_default()
            .value()
            .clone()
    }
}

#[async_trait]
impl EnvelopeStorage for InMemoryEnvelopeStorage {
    async fn store(&self, identity: &Identity, envelope: Envelope) -> Result<(), LimeError> {
        let id = envelope
            .id()
            .ok_or_else(|| LimeError::Storage("cannot store an envelope without an id".into()))?;
        let queue = self.queue(identity);
        let mut queue = queue.lock();
        // Storing the same id twice replaces the envelope in place so the
        // queue position is preserved.
        if let Some(slot) = queue.iter_mut().find(|(stored, _)| *stored == id) {
            slot.1 = envelope;
        } else {
            queue.push((id, envelope));
        }
        Ok(())
    }

    async fn get_ids(&self, identity: &Identity) -> Result<Vec<EnvelopeId>, LimeError> {
        match self.queues.get(identity) {
            Some(queue) => Ok(queue.lock().iter().map(|(id, _)| *id).collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn get(
        &self,
        identity: &Identity,
        id: &EnvelopeId,
    ) -> Result<Option<Envelope>, LimeError> {
        match self.queues.get(identity) {
            Some(queue) => Ok(queue
                .lock()
                .iter()
                .find(|(stored, _)| stored == id)
                .map(|(_, envelope)| envelope.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, identity: &Identity, id: &EnvelopeId) -> Result<bool, LimeError> {
        match self.queues.get(identity) {
            Some(queue) => {
                let mut queue = queue.lock();
                let before = queue.len();
                queue.retain(|(stored, _)| stored != id);
                Ok(queue.len() != before)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Message, NotificationEvent, Notification, PlainText, TypedDocument};
    use uuid::Uuid;

    fn identity() -> Identity {
        "bob@example.org".parse().unwrap()
    }

    fn stored_message(body: &str) -> Envelope {
        Envelope::Message(Message::with_id(
            Uuid::new_v4(),
            "bob@example.org".parse().unwrap(),
            PlainText(body.into()).into_document().unwrap(),
        ))
    }

    #[tokio::test]
    async fn store_preserves_insertion_order() {
        let storage = InMemoryEnvelopeStorage::new();
        let first = stored_message("first");
        let second = stored_message("second");
        storage.store(&identity(), first.clone()).await.unwrap();
        storage.store(&identity(), second.clone()).await.unwrap();

        let ids = storage.get_ids(&identity()).await.unwrap();
        assert_eq!(ids, vec![first.id().unwrap(), second.id().unwrap()]);
    }

    #[tokio::test]
    async fn get_and_delete() {
        let storage = InMemoryEnvelopeStorage::new();
        let envelope = stored_message("hello");
        let id = envelope.id().unwrap();
        storage.store(&identity(), envelope.clone()).await.unwrap();

        assert_eq!(storage.get(&identity(), &id).await.unwrap(), Some(envelope));
        assert!(storage.delete(&identity(), &id).await.unwrap());
        assert!(!storage.delete(&identity(), &id).await.unwrap());
        assert_eq!(storage.get(&identity(), &id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn identities_are_isolated_and_case_insensitive() {
        let storage = InMemoryEnvelopeStorage::new();
        storage
            .store(&identity(), stored_message("for bob"))
            .await
            .unwrap();

        let alice: Identity = "alice@example.org".parse().unwrap();
        assert!(storage.get_ids(&alice).await.unwrap().is_empty());

        let shouty: Identity = "BOB@EXAMPLE.ORG".parse().unwrap();
        assert_eq!(storage.get_ids(&shouty).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn envelope_without_id_is_rejected() {
        let storage = InMemoryEnvelopeStorage::new();
        let envelope = Envelope::Notification(Notification {
            id: None,
            from: None,
            to: None,
            pp: None,
            metadata: None,
            event: NotificationEvent::Received,
            reason: None,
        });
        assert!(storage.store(&identity(), envelope).await.is_err());
    }
}
