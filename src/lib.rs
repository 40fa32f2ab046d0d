//! LIME (LIghtweight MEssaging) node core.
//!
//! Implements the session state machine, the channel abstraction that
//! multiplexes the four envelope kinds (message, notification, command,
//! session) over a single transport, and the HTTP emulation layer that maps
//! stateless request/response interactions onto the push-based protocol.
//! Envelopes are JSON with camelCase fields per the LIME specification.

pub mod channel;
pub mod envelope;
pub mod error;
pub mod http;
pub mod storage;
pub mod transport;

pub use channel::client::{establish, ClientEstablishment};
pub use channel::on_demand::{
    ChannelBuilder, ChannelFailure, ChannelListener, OnDemandClientChannel,
};
pub use channel::server::{
    accept, AuthenticationResult, Authenticator, GuestAuthenticator, ServerEstablishment,
};
pub use channel::{Channel, ChannelConfig};
pub use envelope::{
    Command, CommandMethod, CommandStatus, Document, DocumentRegistry, Envelope, EnvelopeId,
    Identity, MediaType, Message, Node, Notification, NotificationEvent, Reason, Session,
    SessionState,
};
pub use error::LimeError;
pub use http::{HttpEmulationListener, HttpListenerConfig, ServerHttpTransport};
pub use storage::{EnvelopeStorage, InMemoryEnvelopeStorage};
pub use transport::{PairTransport, Transport};
