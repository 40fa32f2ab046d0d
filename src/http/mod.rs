//! HTTP emulation layer: maps stateless HTTP request/response interactions
//! onto the push-based channel model.
//!
//! Each authenticated HTTP client is backed by a cached
//! [`ServerHttpTransport`] over which the hosting server establishes a
//! regular LIME session; the listener correlates asynchronous notifications
//! and command responses back to pending HTTP responses, falling back to
//! per-identity envelope storage.

use uuid::Uuid;

use crate::envelope::Envelope;

pub mod listener;
pub mod transport;

pub use listener::{HttpEmulationListener, HttpListenerConfig};
pub use transport::ServerHttpTransport;

/// Work items the server transports hand to the listener's output pump.
#[derive(Debug)]
pub(crate) enum PumpItem {
    /// An envelope the hosting server sent toward the HTTP client.
    Envelope {
        transport_key: String,
        instance: Uuid,
        envelope: Envelope,
    },
    /// The transport closed; evict it from the cache.
    Closed {
        transport_key: String,
        instance: Uuid,
    },
}
