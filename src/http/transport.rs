use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::{
    codes, Authentication, AuthenticationScheme, Envelope, EnvelopeId, Node, PlainAuthentication,
    Reason, Session, SessionState,
};
use crate::error::LimeError;
use crate::http::PumpItem;
use crate::transport::Transport;

/// Server-side transport backing one authenticated HTTP client.
///
/// HTTP requests become envelopes on the input queue, which the hosting
/// server's channel consumes; envelopes the server sends back are routed to
/// the listener's output pump. Because the HTTP client cannot take part in a
/// session negotiation, the transport answers the server's negotiation
/// envelopes itself, presenting plain authentication built from the
/// request's Basic credentials.
pub struct ServerHttpTransport {
    transport_key: String,
    instance: Uuid,
    client_node: Node,
    password: String,
    input_tx: mpsc::Sender<Envelope>,
    input_rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    pump_tx: mpsc::Sender<PumpItem>,
    session: watch::Sender<Option<EnvelopeId>>,
    failure: parking_lot::RwLock<Option<Reason>>,
    closed: CancellationToken,
}

impl ServerHttpTransport {
    pub(crate) fn new(
        transport_key: String,
        client_node: Node,
        password: String,
        pump_tx: mpsc::Sender<PumpItem>,
        queue_capacity: usize,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::channel(queue_capacity.max(8));
        let (session, _) = watch::channel(None);
        let transport = Self {
            transport_key,
            instance: Uuid::new_v4(),
            client_node: client_node.clone(),
            password,
            input_tx,
            input_rx: tokio::sync::Mutex::new(input_rx),
            pump_tx,
            session,
            failure: parking_lot::RwLock::new(None),
            closed: CancellationToken::new(),
        };
        // Kick off establishment: the hosting server sees a fresh client
        // opening a session.
        let mut new_session = Session::with_state(SessionState::New);
        new_session.from = Some(client_node);
        let _ = transport.input_tx.try_send(Envelope::Session(new_session));
        transport
    }

    pub fn transport_key(&self) -> &str {
        &self.transport_key
    }

    /// Distinguishes cache entries that reused the same key; eviction is a
    /// compare-and-remove on this value.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn client_node(&self) -> &Node {
        &self.client_node
    }

    pub fn session_id(&self) -> Option<EnvelopeId> {
        *self.session.borrow()
    }

    /// Reason the hosting server gave when it failed the session, if any.
    pub fn failure_reason(&self) -> Option<Reason> {
        self.failure.read().clone()
    }

    /// Enqueues an envelope produced by an HTTP request toward the hosting
    /// server's channel.
    pub async fn submit(&self, envelope: Envelope) -> Result<(), LimeError> {
        if self.closed.is_cancelled() {
            return Err(LimeError::Transport("transport is closed".into()));
        }
        self.input_tx
            .send(envelope)
            .await
            .map_err(|_| LimeError::Transport("transport is closed".into()))
    }

    /// Waits until the hosting server establishes the session.
    pub async fn wait_established(&self, limit: Duration) -> Result<EnvelopeId, LimeError> {
        let mut session = self.session.subscribe();
        let wait = async {
            loop {
                if let Some(id) = *session.borrow_and_update() {
                    return Ok(id);
                }
                if session.changed().await.is_err() {
                    return Err(self.closed_error());
                }
            }
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.closed_error()),
            result = tokio::time::timeout(limit, wait) => match result {
                Ok(result) => result,
                Err(_) => Err(LimeError::Timeout("session establishment timed out".into())),
            },
        }
    }

    fn closed_error(&self) -> LimeError {
        match self.failure_reason() {
            Some(reason) => LimeError::SessionFailed(reason),
            None => LimeError::Transport("transport is closed".into()),
        }
    }

    /// The auto-negotiation dual of [`crate::channel::server::accept`]:
    /// answers each negotiation step on behalf of the HTTP client.
    async fn answer_session(&self, session: Session) -> Result<(), LimeError> {
        match session.state {
            SessionState::Negotiating => {
                let mut reply = Session::with_state(SessionState::Negotiating);
                reply.id = session.id;
                reply.encryption = session
                    .encryption_options
                    .as_ref()
                    .and_then(|options| options.first().copied());
                reply.compression = session
                    .compression_options
                    .as_ref()
                    .and_then(|options| options.first().copied());
                self.submit(Envelope::Session(reply)).await
            }
            SessionState::Authenticating => {
                let mut reply = Session::with_state(SessionState::Authenticating);
                reply.id = session.id;
                reply.from = Some(self.client_node.clone());
                reply.scheme = Some(AuthenticationScheme::Plain);
                reply.authentication = Some(Authentication::Plain(PlainAuthentication {
                    password: BASE64.encode(&self.password),
                }));
                self.submit(Envelope::Session(reply)).await
            }
            SessionState::Established => {
                let id = session.id.ok_or_else(|| {
                    LimeError::Protocol("established session without id".into())
                })?;
                self.session.send_replace(Some(id));
                Ok(())
            }
            SessionState::Finished | SessionState::Failed => {
                if session.state == SessionState::Failed {
                    *self.failure.write() = Some(session.reason.clone().unwrap_or(Reason {
                        code: codes::SESSION_ERROR,
                        description: None,
                    }));
                }
                debug!(
                    target: "lime::http",
                    transport_key = %self.transport_key,
                    state = ?session.state,
                    "session ended, scheduling eviction"
                );
                self.closed.cancel();
                let _ = self
                    .pump_tx
                    .send(PumpItem::Envelope {
                        transport_key: self.transport_key.clone(),
                        instance: self.instance,
                        envelope: Envelope::Session(session),
                    })
                    .await;
                Ok(())
            }
            other => Err(LimeError::Protocol(format!(
                "unexpected session state '{:?}' from the hosting server",
                other
            ))),
        }
    }
}

#[async_trait]
impl Transport for ServerHttpTransport {
    async fn open(&self, _uri: &str) -> Result<(), LimeError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), LimeError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let _ = self
            .pump_tx
            .send(PumpItem::Closed {
                transport_key: self.transport_key.clone(),
                instance: self.instance,
            })
            .await;
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), LimeError> {
        match envelope {
            Envelope::Session(session) => self.answer_session(session).await,
            envelope => {
                if self.closed.is_cancelled() {
                    return Err(LimeError::Transport("transport is closed".into()));
                }
                self.pump_tx
                    .send(PumpItem::Envelope {
                        transport_key: self.transport_key.clone(),
                        instance: self.instance,
                        envelope,
                    })
                    .await
                    .map_err(|_| LimeError::Transport("listener pump is gone".into()))
            }
        }
    }

    async fn receive(&self) -> Result<Envelope, LimeError> {
        let mut rx = self.input_rx.lock().await;
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
        !self.closed.is_cancelled()
    }
}
