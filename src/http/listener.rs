use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::Transport;
use uuid::Uuid;

use crate::envelope::{
    Command, CommandMethod, CommandStatus, DocumentRegistry, Envelope, EnvelopeId, Identity,
    MediaType, Message, Node, Notification, NotificationEvent, Reason, Session,
};
use crate::error::LimeError;
use crate::http::transport::ServerHttpTransport;
use crate::http::PumpItem;
use crate::storage::EnvelopeStorage;

/// Header carrying the LIME session id on every response.
const SESSION_ID_HEADER: &str = "X-Session-Id";

#[derive(Debug, Clone)]
pub struct HttpListenerConfig {
    /// Deadline for correlation waits and long polls; exceeding it on a
    /// correlated request also closes the backing transport.
    pub request_timeout: Duration,
    /// When enabled, 5xx responses carry the stringified error as a
    /// plain-text body.
    pub write_exceptions_to_output: bool,
    /// Capacity of each transport's input queue.
    pub transport_queue_capacity: usize,
}

impl Default for HttpListenerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            write_exceptions_to_output: true,
            transport_queue_capacity: 32,
        }
    }
}

/// What the output pump hands back to a pending HTTP response.
#[derive(Debug)]
enum PendingOutcome {
    Notification(Notification),
    Command(Command),
    Session(Session),
}

/// HTTP emulation listener.
///
/// Build the [`Router`] with [`HttpEmulationListener::router`] and serve it
/// with any hyper-compatible server; drain [`accept_transport`] from the
/// hosting side and establish a server channel over each yielded transport.
///
/// [`accept_transport`]: HttpEmulationListener::accept_transport
#[derive(Clone)]
pub struct HttpEmulationListener {
    inner: Arc<Inner>,
}

struct Inner {
    config: HttpListenerConfig,
    transports: DashMap<String, Arc<ServerHttpTransport>>,
    pending: DashMap<EnvelopeId, oneshot::Sender<PendingOutcome>>,
    accept_tx: mpsc::Sender<Arc<ServerHttpTransport>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<ServerHttpTransport>>>,
    pump_tx: mpsc::Sender<PumpItem>,
    message_storage: Arc<dyn EnvelopeStorage>,
    notification_storage: Arc<dyn EnvelopeStorage>,
    registry: DocumentRegistry,
    arrivals: DashMap<Identity, Arc<Notify>>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HttpEmulationListener {
    pub fn new(
        config: HttpListenerConfig,
        message_storage: Arc<dyn EnvelopeStorage>,
        notification_storage: Arc<dyn EnvelopeStorage>,
    ) -> Self {
        Self::with_registry(
            config,
            message_storage,
            notification_storage,
            DocumentRegistry::with_defaults(),
        )
    }

    /// Listener validating inbound documents against a custom registry;
    /// unregistered media types pass through opaque.
    pub fn with_registry(
        config: HttpListenerConfig,
        message_storage: Arc<dyn EnvelopeStorage>,
        notification_storage: Arc<dyn EnvelopeStorage>,
        registry: DocumentRegistry,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let (pump_tx, pump_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            config,
            transports: DashMap::new(),
            pending: DashMap::new(),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            pump_tx,
            message_storage,
            notification_storage,
            registry,
            arrivals: DashMap::new(),
            pump: parking_lot::Mutex::new(None),
        });
        let handle = tokio::spawn(pump_loop(Arc::downgrade(&inner), pump_rx));
        *inner.pump.lock() = Some(handle);
        Self { inner }
    }

    /// Router exposing the emulation URI surface; routes are rooted at the
    /// prefix the caller nests this under.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/messages", get(get_message).post(post_message))
            .route("/messages/", get(get_message).post(post_message))
            .route("/storage/messages", get(list_messages))
            .route("/storage/messages/", get(list_messages))
            .route("/storage/messages/{id}", delete(delete_message))
            .route("/storage/notifications", get(get_notification))
            .route("/storage/notifications/", get(get_notification))
            .route("/notifications", post(post_notification))
            .route("/notifications/", post(post_notification))
            .route(
                "/commands/{resource}",
                get(get_command).post(post_command).delete(delete_command),
            )
            .route(
                "/commands/{resource}/",
                get(get_command).post(post_command).delete(delete_command),
            )
            .with_state(self.inner.clone())
    }

    /// Yields each freshly created server transport exactly once so the
    /// hosting server can establish a session over it.
    pub async fn accept_transport(&self) -> Result<Arc<ServerHttpTransport>, LimeError> {
        self.inner
            .accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| LimeError::Transport("listener is gone".into()))
    }

    pub fn message_storage(&self) -> &Arc<dyn EnvelopeStorage> {
        &self.inner.message_storage
    }

    pub fn notification_storage(&self) -> &Arc<dyn EnvelopeStorage> {
        &self.inner.notification_storage
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
struct CorrelationQuery {
    id: Option<Uuid>,
}

struct AuthContext {
    node: Node,
    identity: Identity,
    transport_key: String,
    password: String,
}

/// HTTP Basic authentication; the hashed pair keys the transport cache.
fn authenticate(headers: &HeaderMap) -> Result<AuthContext, Response> {
    let challenge = || {
        (
            StatusCode::UNAUTHORIZED,
            [(WWW_AUTHENTICATE, "Basic realm=\"lime\"")],
        )
            .into_response()
    };
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(challenge)?;
    let encoded = header.strip_prefix("Basic ").ok_or_else(challenge)?;
    let decoded = BASE64
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(challenge)?;
    let (name, password) = decoded.split_once(':').ok_or_else(challenge)?;
    let node: Node = name.parse().map_err(|_| challenge())?;

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let transport_key = format!("{:x}", hasher.finalize());

    Ok(AuthContext {
        identity: node.identity.clone(),
        node,
        transport_key,
        password: password.to_string(),
    })
}

/// Get-or-create against the transport cache; a dead cached transport is
/// removed by compare-and-remove on its instance before a fresh one is
/// inserted and posted to the acceptance queue.
async fn client_transport(
    inner: &Arc<Inner>,
    auth: &AuthContext,
) -> Result<Arc<ServerHttpTransport>, Response> {
    loop {
        if let Some(cached) = inner.transports.get(&auth.transport_key) {
            let transport = cached.clone();
            drop(cached);
            if transport.is_connected() {
                return Ok(transport);
            }
            inner
                .transports
                .remove_if(&auth.transport_key, |_, value| {
                    value.instance() == transport.instance()
                });
            continue;
        }

        let fresh = Arc::new(ServerHttpTransport::new(
            auth.transport_key.clone(),
            auth.node.clone(),
            auth.password.clone(),
            inner.pump_tx.clone(),
            inner.config.transport_queue_capacity,
        ));
        match inner.transports.entry(auth.transport_key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(fresh.clone());
            }
            Entry::Occupied(_) => continue,
        }
        if inner.accept_tx.send(fresh.clone()).await.is_err() {
            return Err(internal_error(
                inner,
                &LimeError::Transport("acceptance queue is gone".into()),
            ));
        }
        return Ok(fresh);
    }
}

/// Resolves the transport and waits for its session, translating failures
/// to the HTTP surface.
async fn established_transport(
    inner: &Arc<Inner>,
    headers: &HeaderMap,
) -> Result<(Arc<ServerHttpTransport>, AuthContext, EnvelopeId), Response> {
    let auth = authenticate(headers)?;
    let transport = client_transport(inner, &auth).await?;
    let session_id = transport
        .wait_established(inner.config.request_timeout)
        .await
        .map_err(|error| error_to_response(inner, error))?;
    Ok((transport, auth, session_id))
}

fn error_to_response(inner: &Arc<Inner>, error: LimeError) -> Response {
    match &error {
        LimeError::SessionFailed(reason) => {
            (reason_status(reason), reason.to_string()).into_response()
        }
        LimeError::Timeout(_) => StatusCode::REQUEST_TIMEOUT.into_response(),
        LimeError::Authentication(_) | LimeError::Authorization(_) => {
            StatusCode::UNAUTHORIZED.into_response()
        }
        _ => internal_error(inner, &error),
    }
}

fn internal_error(inner: &Arc<Inner>, error: &LimeError) -> Response {
    if inner.config.write_exceptions_to_output {
        (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
    } else {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

/// Reason-code ranges map onto HTTP statuses: session errors and
/// authorization errors are 401, validation errors 400, anything else 403.
fn reason_status(reason: &Reason) -> StatusCode {
    match reason.code {
        10..=19 | 30..=39 => StatusCode::UNAUTHORIZED,
        20..=29 => StatusCode::BAD_REQUEST,
        _ => StatusCode::FORBIDDEN,
    }
}

fn with_session_id(mut response: Response, session_id: EnvelopeId) -> Response {
    if let Ok(value) = session_id.to_string().parse() {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body).into_response()
}

fn arrival(inner: &Arc<Inner>, identity: &Identity) -> Arc<Notify> {
    inner
        .arrivals
        .entry(identity.clone())
        .or_default()
        .clone()
}

/// POST /messages/: fire-and-forget; with `?id=` the response is held until
/// the matching notification (or session failure) arrives.
async fn post_message(
    State(inner): State<Arc<Inner>>,
    Query(query): Query<CorrelationQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (transport, _auth, session_id) = match established_transport(&inner, &headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let mut message: Message = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(error) => {
            return with_session_id(
                (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
                session_id,
            );
        }
    };
    message.from = Some(transport.client_node().clone());
    if query.id.is_some() {
        message.id = query.id;
    }
    if let Err(error) = inner
        .registry
        .decode(message.media_type.clone(), message.content.clone())
    {
        return with_session_id(
            (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
            session_id,
        );
    }

    let correlation = match message.id {
        // At most one in-flight correlation per id; a second request with
        // the same id degrades to fire-and-forget.
        Some(id) => register_pending(&inner, id),
        None => None,
    };

    if let Err(error) = transport.submit(Envelope::Message(message)).await {
        return with_session_id(error_to_response(&inner, error), session_id);
    }

    let Some((id, receiver)) = correlation else {
        return with_session_id(StatusCode::ACCEPTED.into_response(), session_id);
    };
    let response = await_pending(&inner, &transport, id, receiver).await;
    with_session_id(response, session_id)
}

/// GET /messages/ long-poll: dequeues the oldest stored message for the
/// authenticated identity, waiting until one arrives or the request times
/// out.
async fn get_message(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Response {
    let (_transport, auth, session_id) = match established_transport(&inner, &headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let response = long_poll_dequeue(&inner, &inner.message_storage, &auth.identity).await;
    with_session_id(response, session_id)
}

/// GET /storage/messages/: lists stored message ids; 204 when empty.
async fn list_messages(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Response {
    let (_transport, auth, session_id) = match established_transport(&inner, &headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let ids = match inner.message_storage.get_ids(&auth.identity).await {
        Ok(ids) => ids,
        Err(error) => return with_session_id(internal_error(&inner, &error), session_id),
    };
    let response = if ids.is_empty() {
        StatusCode::NO_CONTENT.into_response()
    } else {
        match serde_json::to_vec(&ids) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(error) => internal_error(&inner, &error.into()),
        }
    };
    with_session_id(response, session_id)
}

/// DELETE /storage/messages/{id}
async fn delete_message(
    State(inner): State<Arc<Inner>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let (_transport, auth, session_id) = match established_transport(&inner, &headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let response = match inner.message_storage.delete(&auth.identity, &id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(error) => internal_error(&inner, &error),
    };
    with_session_id(response, session_id)
}

/// GET /storage/notifications/: long-poll over stored notifications.
async fn get_notification(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Response {
    let (_transport, auth, session_id) = match established_transport(&inner, &headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let response = long_poll_dequeue(&inner, &inner.notification_storage, &auth.identity).await;
    with_session_id(response, session_id)
}

/// POST /notifications/: injects a notification toward the hosting server.
async fn post_notification(
    State(inner): State<Arc<Inner>>,
    Query(query): Query<CorrelationQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (transport, _auth, session_id) = match established_transport(&inner, &headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let mut notification: Notification = match serde_json::from_slice(&body) {
        Ok(notification) => notification,
        Err(error) => {
            return with_session_id(
                (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
                session_id,
            );
        }
    };
    notification.from = Some(transport.client_node().clone());
    if query.id.is_some() {
        notification.id = query.id;
    }
    let response = match transport
        .submit(Envelope::Notification(notification))
        .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(error) => error_to_response(&inner, error),
    };
    with_session_id(response, session_id)
}

async fn get_command(
    State(inner): State<Arc<Inner>>,
    Path(resource): Path<String>,
    Query(query): Query<CorrelationQuery>,
    headers: HeaderMap,
) -> Response {
    run_command(&inner, &headers, resource, query, CommandMethod::Get, None).await
}

async fn post_command(
    State(inner): State<Arc<Inner>>,
    Path(resource): Path<String>,
    Query(query): Query<CorrelationQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_command(
        &inner,
        &headers,
        resource,
        query,
        CommandMethod::Set,
        Some(body),
    )
    .await
}

async fn delete_command(
    State(inner): State<Arc<Inner>>,
    Path(resource): Path<String>,
    Query(query): Query<CorrelationQuery>,
    headers: HeaderMap,
) -> Response {
    run_command(
        &inner,
        &headers,
        resource,
        query,
        CommandMethod::Delete,
        None,
    )
    .await
}

/// Translates an HTTP verb on `/commands/{resource}/` into a command
/// envelope and synchronously awaits the response.
async fn run_command(
    inner: &Arc<Inner>,
    headers: &HeaderMap,
    resource: String,
    query: CorrelationQuery,
    method: CommandMethod,
    body: Option<Bytes>,
) -> Response {
    let (transport, _auth, session_id) = match established_transport(inner, headers).await {
        Ok(ok) => ok,
        Err(response) => return response,
    };

    let id = query.id.unwrap_or_else(Uuid::new_v4);
    let mut command = Command::request(id, method, format!("/{}", resource.trim_matches('/')));
    command.from = Some(transport.client_node().clone());
    if let Some(body) = body {
        let content: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(content) => content,
            Err(error) => {
                return with_session_id(
                    (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
                    session_id,
                );
            }
        };
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<MediaType>().ok())
            .unwrap_or_else(|| MediaType::from_static("application/json"));
        if let Err(error) = inner.registry.decode(media_type.clone(), content.clone()) {
            return with_session_id(
                (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
                session_id,
            );
        }
        command.media_type = Some(media_type);
        command.resource = Some(content);
    }

    let Some((id, receiver)) = register_pending(inner, id) else {
        // A correlation for this id is already in flight; commands cannot
        // complete without one.
        return with_session_id(StatusCode::CONFLICT.into_response(), session_id);
    };
    if let Err(error) = transport.submit(Envelope::Command(command)).await {
        inner.pending.remove(&id);
        return with_session_id(error_to_response(inner, error), session_id);
    }
    let response = await_pending(inner, &transport, id, receiver).await;
    with_session_id(response, session_id)
}

/// Registers a pending correlation; `None` when the id is already taken.
fn register_pending(
    inner: &Arc<Inner>,
    id: EnvelopeId,
) -> Option<(EnvelopeId, oneshot::Receiver<PendingOutcome>)> {
    match inner.pending.entry(id) {
        Entry::Occupied(_) => None,
        Entry::Vacant(slot) => {
            let (tx, rx) = oneshot::channel();
            slot.insert(tx);
            Some((id, rx))
        }
    }
}

/// Holds the HTTP response until the output pump completes the correlation;
/// timing out closes the backing transport, invalidating the cache entry.
async fn await_pending(
    inner: &Arc<Inner>,
    transport: &Arc<ServerHttpTransport>,
    id: EnvelopeId,
    receiver: oneshot::Receiver<PendingOutcome>,
) -> Response {
    let outcome = match tokio::time::timeout(inner.config.request_timeout, receiver).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => {
            inner.pending.remove(&id);
            return internal_error(
                inner,
                &LimeError::Transport("pending response dropped".into()),
            );
        }
        Err(_) => {
            inner.pending.remove(&id);
            let _ = transport.close().await;
            return StatusCode::REQUEST_TIMEOUT.into_response();
        }
    };
    match outcome {
        PendingOutcome::Notification(notification) => match notification.event {
            NotificationEvent::Failed => match notification.reason {
                Some(reason) => (reason_status(&reason), reason.to_string()).into_response(),
                None => StatusCode::FORBIDDEN.into_response(),
            },
            _ => StatusCode::CREATED.into_response(),
        },
        PendingOutcome::Command(command) => match command.status {
            Some(CommandStatus::Success) => match command.resource_document() {
                Some(document) => {
                    let body = match serde_json::to_vec(&document.content) {
                        Ok(body) => body,
                        Err(error) => return internal_error(inner, &error.into()),
                    };
                    (
                        StatusCode::CREATED,
                        [(CONTENT_TYPE, document.media_type.to_string())],
                        body,
                    )
                        .into_response()
                }
                None => StatusCode::CREATED.into_response(),
            },
            _ => match command.reason {
                Some(reason) => (reason_status(&reason), reason.to_string()).into_response(),
                None => StatusCode::FORBIDDEN.into_response(),
            },
        },
        PendingOutcome::Session(session) => match session.reason {
            Some(reason) => (reason_status(&reason), reason.to_string()).into_response(),
            None => StatusCode::FORBIDDEN.into_response(),
        },
    }
}

/// Dequeues the oldest stored envelope for the identity, long-polling for an
/// arrival until the request timeout.
async fn long_poll_dequeue(
    inner: &Arc<Inner>,
    storage: &Arc<dyn EnvelopeStorage>,
    identity: &Identity,
) -> Response {
    let deadline = Instant::now() + inner.config.request_timeout;
    loop {
        let notify = arrival(inner, identity);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match dequeue_oldest(storage, identity).await {
            Ok(Some(envelope)) => {
                return match serde_json::to_vec(&envelope) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(error) => internal_error(inner, &error.into()),
                };
            }
            Ok(None) => {}
            Err(error) => return internal_error(inner, &error),
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep_until(deadline) => {
                return StatusCode::REQUEST_TIMEOUT.into_response();
            }
        }
    }
}

async fn dequeue_oldest(
    storage: &Arc<dyn EnvelopeStorage>,
    identity: &Identity,
) -> Result<Option<Envelope>, LimeError> {
    loop {
        let Some(id) = storage.get_ids(identity).await?.into_iter().next() else {
            return Ok(None);
        };
        let envelope = storage.get(identity, &id).await?;
        // Another poller may have raced us to the delete; retry on the next
        // oldest entry.
        if storage.delete(identity, &id).await? {
            if let Some(envelope) = envelope {
                return Ok(Some(envelope));
            }
        }
    }
}

/// Output pump: envelopes the hosting server sends toward HTTP clients are
/// correlated to pending responses or deposited into storage.
async fn pump_loop(inner: Weak<Inner>, mut rx: mpsc::Receiver<PumpItem>) {
    while let Some(item) = rx.recv().await {
        // The pump must not keep the listener alive.
        let Some(inner) = inner.upgrade() else { break };
        match item {
            PumpItem::Closed {
                transport_key,
                instance,
            } => {
                evict(&inner, &transport_key, instance).await;
            }
            PumpItem::Envelope {
                transport_key,
                instance,
                envelope,
            } => match envelope {
                Envelope::Message(message) => {
                    let Some(to) = message.to.clone() else {
                        warn!(target: "lime::http", "dropping message without a recipient");
                        continue;
                    };
                    let identity = to.to_identity();
                    if let Err(error) = inner
                        .message_storage
                        .store(&identity, Envelope::Message(message))
                        .await
                    {
                        warn!(target: "lime::http", %error, "failed to store message");
                        continue;
                    }
                    arrival(&inner, &identity).notify_waiters();
                }
                Envelope::Notification(notification) => {
                    let matched = notification
                        .id
                        .filter(|_| notification.event.is_terminal())
                        .and_then(|id| inner.pending.remove(&id));
                    if let Some((_, tx)) = matched {
                        let _ = tx.send(PendingOutcome::Notification(notification));
                        continue;
                    }
                    let Some(to) = notification.to.clone() else {
                        debug!(target: "lime::http", "dropping unaddressed notification");
                        continue;
                    };
                    let identity = to.to_identity();
                    if let Err(error) = inner
                        .notification_storage
                        .store(&identity, Envelope::Notification(notification))
                        .await
                    {
                        warn!(target: "lime::http", %error, "failed to store notification");
                        continue;
                    }
                    arrival(&inner, &identity).notify_waiters();
                }
                Envelope::Command(command) => {
                    let is_final = !matches!(command.status, Some(CommandStatus::Pending));
                    let matched = command
                        .id
                        .filter(|_| is_final)
                        .and_then(|id| inner.pending.remove(&id));
                    match matched {
                        Some((_, tx)) => {
                            let _ = tx.send(PendingOutcome::Command(command));
                        }
                        None => {
                            // No storage for commands; an unmatched response
                            // has nobody left to answer.
                            warn!(
                                target: "lime::http",
                                id = ?command.id,
                                "dropping unmatched command envelope"
                            );
                        }
                    }
                }
                Envelope::Session(session) => {
                    if let Some(id) = session.id {
                        if let Some((_, tx)) = inner.pending.remove(&id) {
                            let _ = tx.send(PendingOutcome::Session(session.clone()));
                        }
                    }
                    evict(&inner, &transport_key, instance).await;
                }
            },
        }
    }
}

/// Compare-and-remove keyed by the transport instance, so a replacement
/// transport that reused the cache key survives a stale eviction.
async fn evict(inner: &Arc<Inner>, transport_key: &str, instance: Uuid) {
    let removed = inner
        .transports
        .remove_if(transport_key, |_, value| value.instance() == instance);
    if let Some((_, transport)) = removed {
        debug!(target: "lime::http", %transport_key, "transport evicted");
        let _ = transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryEnvelopeStorage;

    fn listener() -> HttpEmulationListener {
        HttpEmulationListener::new(
            HttpListenerConfig::default(),
            Arc::new(InMemoryEnvelopeStorage::new()),
            Arc::new(InMemoryEnvelopeStorage::new()),
        )
    }

    #[tokio::test]
    async fn at_most_one_pending_correlation_per_id() {
        let listener = listener();
        let id = Uuid::new_v4();
        assert!(register_pending(&listener.inner, id).is_some());
        assert!(register_pending(&listener.inner, id).is_none());

        // The first writer removes the entry, after which the id is free.
        listener.inner.pending.remove(&id);
        assert!(register_pending(&listener.inner, id).is_some());
    }

    #[test]
    fn reason_codes_map_onto_statuses() {
        let cases = [
            (11, StatusCode::UNAUTHORIZED),
            (12, StatusCode::UNAUTHORIZED),
            (21, StatusCode::BAD_REQUEST),
            (25, StatusCode::BAD_REQUEST),
            (29, StatusCode::BAD_REQUEST),
            (31, StatusCode::UNAUTHORIZED),
            (39, StatusCode::UNAUTHORIZED),
            (1, StatusCode::FORBIDDEN),
            (45, StatusCode::FORBIDDEN),
        ];
        for (code, status) in cases {
            let reason = Reason::new(code, "test");
            assert_eq!(reason_status(&reason), status, "code {}", code);
        }
    }

    #[test]
    fn basic_credentials_produce_a_stable_transport_key() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Basic {}", BASE64.encode("alice@example.org:secret"))
                .parse()
                .unwrap(),
        );
        let first = authenticate(&headers).map_err(|_| ()).unwrap();
        let second = authenticate(&headers).map_err(|_| ()).unwrap();
        assert_eq!(first.transport_key, second.transport_key);
        assert_eq!(first.identity, "alice@example.org".parse().unwrap());

        headers.insert(
            AUTHORIZATION,
            format!("Basic {}", BASE64.encode("alice@example.org:other"))
                .parse()
                .unwrap(),
        );
        let changed = authenticate(&headers).map_err(|_| ()).unwrap();
        assert_ne!(first.transport_key, changed.transport_key);
    }
}
