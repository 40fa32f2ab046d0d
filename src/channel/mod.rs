//! Channel: session-scoped, typed envelope exchange over a transport.
//!
//! A channel is created already `Established` by [`client::establish`] or
//! [`server::accept`]; both drive the session negotiation directly on the
//! transport and then hand it to [`Channel::start`], which spawns the single
//! demultiplexing loop feeding the four typed queues.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{
    codes, Command, CommandMethod, Envelope, EnvelopeId, Message, Node, Notification, Ping, Reason,
    Session, SessionState, TypedDocument,
};
use crate::error::LimeError;
use crate::transport::Transport;

pub mod client;
pub mod on_demand;
pub mod server;

/// Timeouts and queue sizing shared by client and server channels.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Capacity of each inbound typed queue. The demultiplexer blocks when a
    /// queue is full, which in turn stops reading from the transport.
    pub inbound_queue_capacity: usize,
    /// Deadline for each negotiation step.
    pub negotiation_step_timeout: Duration,
    /// When set, a channel missing any inbound envelope for this duration
    /// probes the peer with a `get /ping` command.
    pub remote_idle_timeout: Option<Duration>,
    /// How long after an idle probe the channel waits for any inbound
    /// envelope before closing.
    pub ping_response_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inbound_queue_capacity: 1,
            negotiation_step_timeout: Duration::from_secs(60),
            remote_idle_timeout: None,
            ping_response_timeout: Duration::from_secs(30),
        }
    }
}

/// URI probed by the liveness module.
const PING_URI: &str = "/ping";

struct Queues {
    messages: mpsc::Sender<Message>,
    notifications: mpsc::Sender<Notification>,
    commands: mpsc::Sender<Command>,
    sessions: mpsc::Sender<Session>,
}

/// Session-bound endpoint exchanging the four envelope kinds.
///
/// Within one kind inbound order is FIFO; across kinds no order is
/// guaranteed. Once the channel reaches `Finished` or `Failed`, sends fail
/// and receivers drain buffered envelopes before reporting the channel
/// closed.
impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("session_id", &self.session_id)
            .field("local_node", &self.local_node)
            .field("remote_node", &self.remote_node)
            .finish()
    }
}

pub struct Channel {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    session_id: EnvelopeId,
    local_node: Option<Node>,
    remote_node: Option<Node>,
    state: parking_lot::RwLock<SessionState>,
    messages: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    notifications: tokio::sync::Mutex<mpsc::Receiver<Notification>>,
    commands: tokio::sync::Mutex<mpsc::Receiver<Command>>,
    sessions: tokio::sync::Mutex<mpsc::Receiver<Session>>,
    sent_ids: parking_lot::Mutex<HashSet<EnvelopeId>>,
    closed: CancellationToken,
    demux: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Wraps an already-established transport and spawns the demultiplexer.
    pub(crate) fn start(
        transport: Arc<dyn Transport>,
        config: ChannelConfig,
        session_id: EnvelopeId,
        local_node: Option<Node>,
        remote_node: Option<Node>,
    ) -> Arc<Self> {
        let capacity = config.inbound_queue_capacity.max(1);
        let (message_tx, message_rx) = mpsc::channel(capacity);
        let (notification_tx, notification_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (session_tx, session_rx) = mpsc::channel(capacity);

        let channel = Arc::new(Self {
            transport,
            config,
            session_id,
            local_node,
            remote_node,
            state: parking_lot::RwLock::new(SessionState::Established),
            messages: tokio::sync::Mutex::new(message_rx),
            notifications: tokio::sync::Mutex::new(notification_rx),
            commands: tokio::sync::Mutex::new(command_rx),
            sessions: tokio::sync::Mutex::new(session_rx),
            sent_ids: parking_lot::Mutex::new(HashSet::new()),
            closed: CancellationToken::new(),
            demux: parking_lot::Mutex::new(None),
        });

        let queues = Queues {
            messages: message_tx,
            notifications: notification_tx,
            commands: command_tx,
            sessions: session_tx,
        };
        let handle = tokio::spawn(demux_loop(channel.clone(), queues));
        *channel.demux.lock() = Some(handle);
        channel
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    pub fn session_id(&self) -> EnvelopeId {
        self.session_id
    }

    /// Node assigned to this side during establishment.
    pub fn local_node(&self) -> Option<&Node> {
        self.local_node.as_ref()
    }

    pub fn remote_node(&self) -> Option<&Node> {
        self.remote_node.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn send_message(
        &self,
        message: Message,
        ct: &CancellationToken,
    ) -> Result<(), LimeError> {
        self.ensure_established()?;
        if let Some(id) = message.id {
            self.claim_envelope_id(id)?;
        }
        self.checked_send(Envelope::Message(message), ct).await
    }

    pub async fn receive_message(&self, ct: &CancellationToken) -> Result<Message, LimeError> {
        let mut rx = self.messages.lock().await;
        tokio::select! {
            biased;
            _ = ct.cancelled() => Err(LimeError::Cancelled),
            message = rx.recv() => message.ok_or_else(LimeError::closed),
        }
    }

    pub async fn send_notification(
        &self,
        notification: Notification,
        ct: &CancellationToken,
    ) -> Result<(), LimeError> {
        self.ensure_established()?;
        self.checked_send(Envelope::Notification(notification), ct)
            .await
    }

    pub async fn receive_notification(
        &self,
        ct: &CancellationToken,
    ) -> Result<Notification, LimeError> {
        let mut rx = self.notifications.lock().await;
        tokio::select! {
            biased;
            _ = ct.cancelled() => Err(LimeError::Cancelled),
            notification = rx.recv() => notification.ok_or_else(LimeError::closed),
        }
    }

    pub async fn send_command(
        &self,
        command: Command,
        ct: &CancellationToken,
    ) -> Result<(), LimeError> {
        self.ensure_established()?;
        if command.is_request() {
            if let Some(id) = command.id {
                self.claim_envelope_id(id)?;
            }
        }
        self.checked_send(Envelope::Command(command), ct).await
    }

    pub async fn receive_command(&self, ct: &CancellationToken) -> Result<Command, LimeError> {
        let mut rx = self.commands.lock().await;
        tokio::select! {
            biased;
            _ = ct.cancelled() => Err(LimeError::Cancelled),
            command = rx.recv() => command.ok_or_else(LimeError::closed),
        }
    }

    /// Sends `finishing` and waits for the peer's `finished` reply, then
    /// closes the transport.
    pub async fn finish(&self, ct: &CancellationToken) -> Result<Session, LimeError> {
        self.ensure_established()?;
        *self.state.write() = SessionState::Finishing;
        let mut finishing = Session::with_state(SessionState::Finishing);
        finishing.id = Some(self.session_id);
        self.transport.send(Envelope::Session(finishing)).await?;
        let finished = self.receive_finished_session(ct).await?;
        let _ = self.transport.close().await;
        Ok(finished)
    }

    /// Waits for the session envelope that ends the channel.
    pub async fn receive_finished_session(
        &self,
        ct: &CancellationToken,
    ) -> Result<Session, LimeError> {
        let mut rx = self.sessions.lock().await;
        let session = tokio::select! {
            biased;
            _ = ct.cancelled() => return Err(LimeError::Cancelled),
            session = rx.recv() => session.ok_or_else(LimeError::closed)?,
        };
        match session.state {
            SessionState::Finished => Ok(session),
            SessionState::Failed => Err(LimeError::SessionFailed(session.reason.unwrap_or(
                Reason {
                    code: codes::SESSION_ERROR,
                    description: None,
                },
            ))),
            other => Err(LimeError::Protocol(format!(
                "unexpected session state '{:?}' while waiting for finished",
                other
            ))),
        }
    }

    /// Force-closes the channel and its transport without the finishing
    /// handshake.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if !state.is_terminal() {
                *state = SessionState::Finished;
            }
        }
        self.closed.cancel();
        let _ = self.transport.close().await;
    }

    fn ensure_established(&self) -> Result<(), LimeError> {
        if self.is_established() {
            Ok(())
        } else {
            Err(LimeError::closed())
        }
    }

    /// Enforces envelope-id uniqueness within the channel's lifetime for
    /// commands and messages that expect notifications.
    fn claim_envelope_id(&self, id: EnvelopeId) -> Result<(), LimeError> {
        if self.sent_ids.lock().insert(id) {
            Ok(())
        } else {
            Err(LimeError::Protocol(format!(
                "envelope id {} already used on this channel",
                id
            )))
        }
    }

    async fn checked_send(
        &self,
        envelope: Envelope,
        ct: &CancellationToken,
    ) -> Result<(), LimeError> {
        let result = tokio::select! {
            biased;
            _ = ct.cancelled() => Err(LimeError::Cancelled),
            sent = self.transport.send(envelope) => sent,
        };
        if let Err(error) = &result {
            if !matches!(error, LimeError::Cancelled) {
                self.fail();
            }
        }
        result
    }

    fn fail(&self) {
        let mut state = self.state.write();
        if !state.is_terminal() {
            *state = SessionState::Failed;
        }
        drop(state);
        self.closed.cancel();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.closed.cancel();
        if let Some(handle) = self.demux.lock().take() {
            handle.abort();
        }
    }
}

/// Demultiplexer-local liveness state: whether an idle probe is in flight
/// and the ids of probes whose responses must be swallowed.
#[derive(Default)]
struct PingState {
    awaiting_any_envelope: bool,
    outstanding: HashSet<EnvelopeId>,
}

async fn demux_loop(channel: Arc<Channel>, queues: Queues) {
    let mut ping = PingState::default();
    loop {
        let flow = tokio::select! {
            biased;
            _ = channel.closed.cancelled() => ControlFlow::Break(()),
            flow = demux_step(&channel, &queues, &mut ping) => flow,
        };
        if flow.is_break() {
            break;
        }
    }
    // Queue senders drop here; receivers drain buffered envelopes and then
    // observe the channel as closed.
}

async fn demux_step(
    channel: &Arc<Channel>,
    queues: &Queues,
    ping: &mut PingState,
) -> ControlFlow<()> {
    let received = match channel.config.remote_idle_timeout {
        Some(idle) => {
            let limit = if ping.awaiting_any_envelope {
                channel.config.ping_response_timeout
            } else {
                idle
            };
            match tokio::time::timeout(limit, channel.transport.receive()).await {
                Ok(received) => {
                    // Any inbound envelope proves liveness.
                    ping.awaiting_any_envelope = false;
                    received
                }
                Err(_) if !ping.awaiting_any_envelope => {
                    debug!(target: "lime::channel", session_id = %channel.session_id, "remote idle, probing with ping");
                    let probe_id = Uuid::new_v4();
                    let probe = Command::request(probe_id, CommandMethod::Get, PING_URI);
                    if channel.transport.send(Envelope::Command(probe)).await.is_err() {
                        channel.fail();
                        return ControlFlow::Break(());
                    }
                    ping.awaiting_any_envelope = true;
                    ping.outstanding.insert(probe_id);
                    return ControlFlow::Continue(());
                }
                Err(_) => {
                    warn!(target: "lime::channel", session_id = %channel.session_id, "ping unanswered, closing channel");
                    channel.fail();
                    return ControlFlow::Break(());
                }
            }
        }
        None => channel.transport.receive().await,
    };

    let envelope = match received {
        Ok(envelope) => envelope,
        Err(error) => {
            debug!(target: "lime::channel", session_id = %channel.session_id, %error, "transport receive failed");
            channel.fail();
            return ControlFlow::Break(());
        }
    };

    route_envelope(channel, queues, ping, envelope).await
}

async fn route_envelope(
    channel: &Arc<Channel>,
    queues: &Queues,
    ping: &mut PingState,
    envelope: Envelope,
) -> ControlFlow<()> {
    match envelope {
        Envelope::Message(message) => {
            if queues.messages.send(message).await.is_err() {
                return ControlFlow::Break(());
            }
        }
        Envelope::Notification(notification) => {
            if queues.notifications.send(notification).await.is_err() {
                return ControlFlow::Break(());
            }
        }
        Envelope::Command(command) => {
            if command.is_request()
                && command.method == CommandMethod::Get
                && command.uri.as_deref() == Some(PING_URI)
            {
                return reply_ping(channel, command).await;
            }
            // Responses to our own liveness probes are infrastructure too.
            if let Some(id) = command.id {
                if !command.is_request() && ping.outstanding.remove(&id) {
                    return ControlFlow::Continue(());
                }
            }
            if queues.commands.send(command).await.is_err() {
                return ControlFlow::Break(());
            }
        }
        Envelope::Session(session) => return handle_session(channel, queues, session).await,
    }
    ControlFlow::Continue(())
}

/// Liveness probes are infrastructure; they never reach the application
/// queue.
async fn reply_ping(channel: &Arc<Channel>, request: Command) -> ControlFlow<()> {
    let resource = match (Ping {}).into_document() {
        Ok(document) => Some(document),
        Err(_) => None,
    };
    let response = Command::success_response(&request, resource);
    if channel
        .transport
        .send(Envelope::Command(response))
        .await
        .is_err()
    {
        channel.fail();
        return ControlFlow::Break(());
    }
    ControlFlow::Continue(())
}

async fn handle_session(
    channel: &Arc<Channel>,
    queues: &Queues,
    session: Session,
) -> ControlFlow<()> {
    match session.state {
        SessionState::Finishing => {
            let mut finished = Session::with_state(SessionState::Finished);
            finished.id = Some(channel.session_id);
            let _ = channel
                .transport
                .send(Envelope::Session(finished.clone()))
                .await;
            // Waiters observe the terminal envelope, not the request.
            let _ = queues.sessions.try_send(finished);
            *channel.state.write() = SessionState::Finished;
            channel.closed.cancel();
            ControlFlow::Break(())
        }
        SessionState::Finished => {
            let _ = queues.sessions.try_send(session);
            *channel.state.write() = SessionState::Finished;
            channel.closed.cancel();
            ControlFlow::Break(())
        }
        SessionState::Failed => {
            let _ = queues.sessions.try_send(session);
            channel.fail();
            ControlFlow::Break(())
        }
        other => {
            warn!(target: "lime::channel", session_id = %channel.session_id, state = ?other, "unexpected session envelope on established channel");
            let failure = Session::failure(
                Some(channel.session_id),
                Reason::new(
                    codes::VALIDATION_INVALID_ENVELOPE,
                    "unexpected session envelope",
                ),
            );
            let _ = channel.transport.send(Envelope::Session(failure)).await;
            channel.fail();
            let _ = channel.transport.close().await;
            ControlFlow::Break(())
        }
    }
}
