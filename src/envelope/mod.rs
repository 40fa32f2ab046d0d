//! Envelope model: the four LIME envelope kinds, node addressing, reasons,
//! and document payloads.
//!
//! Envelopes travel as JSON with camelCase fields. The wire discriminator is
//! structural: `content` marks a message, `event` a notification, `method` a
//! command, and `state` a session envelope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod document;
pub mod node;
pub mod reason;

pub use document::{Document, DocumentRegistry, MediaType, Ping, PlainText, TypedDocument};
pub use node::{Identity, Node};
pub use reason::{codes, Reason};

/// Envelope identifier; optional on fire-and-forget messages.
pub type EnvelopeId = Uuid;

/// The unit of exchange between two LIME nodes.
///
/// Variant order matters: serde tries each in turn, and the required field of
/// each kind (`state`, `event`, `method`, `content`) makes the match
/// unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Session(Session),
    Notification(Notification),
    Command(Command),
    Message(Message),
}

impl Envelope {
    pub fn id(&self) -> Option<EnvelopeId> {
        match self {
            Envelope::Session(s) => s.id,
            Envelope::Notification(n) => n.id,
            Envelope::Command(c) => c.id,
            Envelope::Message(m) => m.id,
        }
    }

    pub fn from(&self) -> Option<&Node> {
        match self {
            Envelope::Session(s) => s.from.as_ref(),
            Envelope::Notification(n) => n.from.as_ref(),
            Envelope::Command(c) => c.from.as_ref(),
            Envelope::Message(m) => m.from.as_ref(),
        }
    }

    pub fn to(&self) -> Option<&Node> {
        match self {
            Envelope::Session(s) => s.to.as_ref(),
            Envelope::Notification(n) => n.to.as_ref(),
            Envelope::Command(c) => c.to.as_ref(),
            Envelope::Message(m) => m.to.as_ref(),
        }
    }

    /// Envelope kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Session(_) => "session",
            Envelope::Notification(_) => "notification",
            Envelope::Command(_) => "command",
            Envelope::Message(_) => "message",
        }
    }
}

/// Content-carrying envelope addressed to another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EnvelopeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    /// Originator when the message is sent on behalf of another node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pp: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub content: Value,
}

impl Message {
    /// Fire-and-forget message: no id, so the peer sends no notifications.
    pub fn fire_and_forget(to: Node, document: Document) -> Self {
        Self {
            id: None,
            from: None,
            to: Some(to),
            pp: None,
            metadata: None,
            media_type: document.media_type,
            content: document.content,
        }
    }

    /// Message with an id; the peer reports delivery through notifications
    /// referencing it.
    pub fn with_id(id: EnvelopeId, to: Node, document: Document) -> Self {
        Self {
            id: Some(id),
            ..Self::fire_and_forget(to, document)
        }
    }

    pub fn document(&self) -> Document {
        Document::new(self.media_type.clone(), self.content.clone())
    }
}

/// Delivery lifecycle event for a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationEvent {
    Accepted,
    Validated,
    Authorized,
    Dispatched,
    Received,
    Consumed,
    Failed,
}

impl NotificationEvent {
    /// Terminal events close the message's delivery lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationEvent::Dispatched | NotificationEvent::Failed)
    }
}

/// Reports progress of a message identified by `id` through the delivery
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EnvelopeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pp: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    pub event: NotificationEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Notification {
    pub fn for_message(id: EnvelopeId, event: NotificationEvent) -> Self {
        Self {
            id: Some(id),
            from: None,
            to: None,
            pp: None,
            metadata: None,
            event,
            reason: None,
        }
    }

    pub fn failure(id: EnvelopeId, reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::for_message(id, NotificationEvent::Failed)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandMethod {
    Get,
    Set,
    Delete,
    Subscribe,
    Unsubscribe,
    Observe,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    Success,
    Failure,
    Pending,
}

/// CRUD-style operation on a resource. Requests carry an `id`; responses
/// reuse it and set `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EnvelopeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pp: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub method: CommandMethod,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Command {
    pub fn request(id: EnvelopeId, method: CommandMethod, uri: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            from: None,
            to: None,
            pp: None,
            metadata: None,
            uri: Some(uri.into()),
            method,
            media_type: None,
            resource: None,
            status: None,
            reason: None,
        }
    }

    pub fn with_resource(mut self, document: Document) -> Self {
        self.media_type = Some(document.media_type);
        self.resource = Some(document.content);
        self
    }

    /// Success response echoing the request id, optionally carrying a
    /// resource document.
    pub fn success_response(request: &Command, resource: Option<Document>) -> Self {
        let mut response = Self {
            id: request.id,
            from: request.to.clone(),
            to: request.from.clone(),
            pp: None,
            metadata: None,
            uri: None,
            method: request.method,
            media_type: None,
            resource: None,
            status: Some(CommandStatus::Success),
            reason: None,
        };
        if let Some(document) = resource {
            response.media_type = Some(document.media_type);
            response.resource = Some(document.content);
        }
        response
    }

    pub fn failure_response(request: &Command, reason: Reason) -> Self {
        Self {
            status: Some(CommandStatus::Failure),
            reason: Some(reason),
            ..Self::success_response(request, None)
        }
    }

    /// A command without a status is a request awaiting one.
    pub fn is_request(&self) -> bool {
        self.status.is_none()
    }

    pub fn resource_document(&self) -> Option<Document> {
        match (&self.media_type, &self.resource) {
            (Some(media_type), Some(resource)) => {
                Some(Document::new(media_type.clone(), resource.clone()))
            }
            _ => None,
        }
    }
}

/// Session lifecycle state; doubles as the channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    New,
    Negotiating,
    Authenticating,
    Established,
    Finishing,
    Finished,
    Failed,
}

impl SessionState {
    /// Terminal states admit no further envelope exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEncryption {
    None,
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionCompression {
    None,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthenticationScheme {
    Guest,
    Plain,
    Key,
    Transport,
    External,
}

/// Credentials presented during the authenticating step.
///
/// The `scheme` field of the session envelope selects the meaning; the
/// payload shapes are distinct enough for structural matching, with the
/// empty guest payload last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Authentication {
    Plain(PlainAuthentication),
    Key(KeyAuthentication),
    External(ExternalAuthentication),
    Guest(GuestAuthentication),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainAuthentication {
    /// Base64 of the password, per the LIME specification.
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAuthentication {
    /// Base64 of the access key.
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAuthentication {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestAuthentication {}

/// Negotiation and lifecycle envelope exchanged while a session is being
/// set up or torn down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EnvelopeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pp: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_options: Option<Vec<SessionEncryption>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<SessionEncryption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_options: Option<Vec<SessionCompression>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<SessionCompression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme_options: Option<Vec<AuthenticationScheme>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<AuthenticationScheme>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Session {
    pub fn with_state(state: SessionState) -> Self {
        Self {
            id: None,
            from: None,
            to: None,
            pp: None,
            metadata: None,
            state,
            encryption_options: None,
            encryption: None,
            compression_options: None,
            compression: None,
            scheme_options: None,
            scheme: None,
            authentication: None,
            reason: None,
        }
    }

    pub fn failure(id: Option<EnvelopeId>, reason: Reason) -> Self {
        Self {
            id,
            reason: Some(reason),
            ..Self::with_state(SessionState::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(envelope: &Envelope) -> Envelope {
        let json = serde_json::to_string(envelope).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn message_round_trip() {
        let envelope = Envelope::Message(Message::with_id(
            Uuid::new_v4(),
            "bob@example.org".parse().unwrap(),
            PlainText("hi".into()).into_document().unwrap(),
        ));
        assert_eq!(round_trip(&envelope), envelope);
    }

    #[test]
    fn notification_round_trip() {
        let mut notification =
            Notification::for_message(Uuid::new_v4(), NotificationEvent::Dispatched);
        notification.to = Some("alice@example.org/home".parse().unwrap());
        let envelope = Envelope::Notification(notification);
        assert_eq!(round_trip(&envelope), envelope);

        let failed = Envelope::Notification(Notification::failure(
            Uuid::new_v4(),
            Reason::new(codes::GENERAL_ERROR, "boom"),
        ));
        assert_eq!(round_trip(&failed), failed);
    }

    #[test]
    fn command_round_trip() {
        let request = Command::request(Uuid::new_v4(), CommandMethod::Get, "/ping")
            .with_resource(Ping {}.into_document().unwrap());
        let response = Command::success_response(&request, Some(Ping {}.into_document().unwrap()));
        for command in [request, response] {
            let envelope = Envelope::Command(command);
            assert_eq!(round_trip(&envelope), envelope);
        }
    }

    #[test]
    fn session_round_trip_all_negotiation_fields() {
        let mut session = Session::with_state(SessionState::Negotiating);
        session.id = Some(Uuid::new_v4());
        session.from = Some("server@example.org/srv1".parse().unwrap());
        session.encryption_options = Some(vec![SessionEncryption::None, SessionEncryption::Tls]);
        session.compression_options = Some(vec![SessionCompression::None]);
        let envelope = Envelope::Session(session);
        assert_eq!(round_trip(&envelope), envelope);

        let mut auth = Session::with_state(SessionState::Authenticating);
        auth.scheme = Some(AuthenticationScheme::Plain);
        auth.authentication = Some(Authentication::Plain(PlainAuthentication {
            password: "c2VjcmV0".into(),
        }));
        let envelope = Envelope::Session(auth);
        assert_eq!(round_trip(&envelope), envelope);
    }

    #[test]
    fn structural_discriminator() {
        let message: Envelope = serde_json::from_value(json!({
            "to": "bob@example.org",
            "type": "text/plain",
            "content": "hi"
        }))
        .unwrap();
        assert!(matches!(message, Envelope::Message(_)));

        let notification: Envelope = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "event": "received"
        }))
        .unwrap();
        assert!(matches!(notification, Envelope::Notification(_)));

        let command: Envelope = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "method": "get",
            "uri": "/ping"
        }))
        .unwrap();
        assert!(matches!(command, Envelope::Command(_)));

        let session: Envelope = serde_json::from_value(json!({
            "state": "new"
        }))
        .unwrap();
        assert!(matches!(session, Envelope::Session(_)));
    }

    #[test]
    fn wire_fields_are_camel_case() {
        let mut session = Session::with_state(SessionState::Negotiating);
        session.encryption_options = Some(vec![SessionEncryption::Tls]);
        let json = serde_json::to_value(Envelope::Session(session)).unwrap();
        assert_eq!(json["state"], json!("negotiating"));
        assert_eq!(json["encryptionOptions"], json!(["tls"]));
    }

    #[test]
    fn guest_authentication_is_empty_object() {
        let mut session = Session::with_state(SessionState::Authenticating);
        session.scheme = Some(AuthenticationScheme::Guest);
        session.authentication = Some(Authentication::Guest(GuestAuthentication {}));
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["authentication"], json!({}));
        let back: Session = serde_json::from_value(json).unwrap();
        assert_eq!(back, session);
    }
}
