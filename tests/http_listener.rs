use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use lime::channel::server::{accept, AuthenticationResult, Authenticator, ServerEstablishment};
use lime::channel::{Channel, ChannelConfig};
use lime::envelope::{
    codes, Authentication, AuthenticationScheme, Command, Identity, Notification,
    NotificationEvent, PlainText, Reason, TypedDocument,
};
use lime::http::{HttpEmulationListener, HttpListenerConfig};
use lime::storage::{EnvelopeStorage, InMemoryEnvelopeStorage};
use lime::transport::Transport;

/// Accepts any identity that presents plain credentials.
struct PlainAcceptor;

#[async_trait]
impl Authenticator for PlainAcceptor {
    async fn authenticate(
        &self,
        _identity: &Identity,
        scheme: AuthenticationScheme,
        authentication: Option<&Authentication>,
    ) -> AuthenticationResult {
        match (scheme, authentication) {
            (AuthenticationScheme::Plain, Some(Authentication::Plain(_))) => {
                AuthenticationResult::Accepted
            }
            _ => AuthenticationResult::Rejected(Reason::new(
                codes::SESSION_AUTHENTICATION_FAILED,
                "plain credentials required",
            )),
        }
    }
}

fn test_listener(request_timeout: Duration) -> HttpEmulationListener {
    HttpEmulationListener::new(
        HttpListenerConfig {
            request_timeout,
            ..HttpListenerConfig::default()
        },
        Arc::new(InMemoryEnvelopeStorage::new()),
        Arc::new(InMemoryEnvelopeStorage::new()),
    )
}

/// Hosts a server channel over every transport the listener yields: messages
/// are routed back out (landing in the recipient's storage) and identified
/// messages are answered with notifications chosen by their text content.
fn spawn_host(listener: HttpEmulationListener) {
    tokio::spawn(async move {
        while let Ok(transport) = listener.accept_transport().await {
            tokio::spawn(async move {
                let ct = CancellationToken::new();
                let transport: Arc<dyn Transport> = transport;
                let channel = match accept(
                    transport,
                    ChannelConfig::default(),
                    ServerEstablishment::new(
                        "postmaster@example.org/http".parse().unwrap(),
                        vec![AuthenticationScheme::Plain],
                    ),
                    Arc::new(PlainAcceptor),
                    &ct,
                )
                .await
                {
                    Ok(channel) => channel,
                    Err(_) => return,
                };
                serve_channel(channel, ct).await;
            });
        }
    });
}

async fn serve_channel(channel: Arc<Channel>, ct: CancellationToken) {
    loop {
        tokio::select! {
            message = channel.receive_message(&ct) => {
                let Ok(message) = message else { break };
                // Route toward the recipient; the output pump stores it.
                let _ = channel.send_message(message.clone(), &ct).await;

                let Some(id) = message.id else { continue };
                let text = PlainText::from_document(&message.document())
                    .map(|text| text.0)
                    .unwrap_or_default();
                if text == "notify-me" {
                    let mut received = Notification::for_message(id, NotificationEvent::Received);
                    received.to = message.from.clone();
                    let _ = channel.send_notification(received, &ct).await;
                }
                let mut outcome = match text.as_str() {
                    "fail-validation" => {
                        Notification::failure(id, Reason::new(25, "content rejected"))
                    }
                    "fail-auth" => Notification::failure(
                        id,
                        Reason::new(codes::SESSION_AUTHENTICATION_FAILED, "not allowed"),
                    ),
                    _ => Notification::for_message(id, NotificationEvent::Dispatched),
                };
                outcome.to = message.from.clone();
                let _ = channel.send_notification(outcome, &ct).await;
            }
            command = channel.receive_command(&ct) => {
                let Ok(command) = command else { break };
                // Pings never reach this queue; everything else is unknown.
                if command.is_request() {
                    let response = Command::failure_response(
                        &command,
                        Reason::new(33, "unknown resource"),
                    );
                    let _ = channel.send_command(response, &ct).await;
                }
            }
        }
    }
}

fn basic(user: &str, password: &str) -> String {
    format!(
        "Basic {}",
        BASE64.encode(format!("{}:{}", user, password))
    )
}

async fn send_request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, basic("alice@example.org", "secret"));
    let request = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            builder.body(Body::from(value.to_string())).unwrap()
        }
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, bytes.to_vec())
}

fn text_body(to: &str, content: &str) -> Value {
    json!({ "to": to, "type": "text/plain", "content": content })
}

#[tokio::test]
async fn fire_and_forget_message_is_stored_for_the_recipient() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    let (status, headers, _) = send_request(
        &router,
        "POST",
        "/messages/",
        Some(text_body("bob@example.org", "hi")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let session_id = headers
        .get("X-Session-Id")
        .and_then(|value| value.to_str().ok())
        .expect("every response carries the session id");
    assert!(Uuid::parse_str(session_id).is_ok());

    // Routing is asynchronous; poll the storage briefly.
    let bob: Identity = "bob@example.org".parse().unwrap();
    let mut ids = Vec::new();
    for _ in 0..50 {
        ids = listener.message_storage().get_ids(&bob).await.unwrap();
        if !ids.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn identified_message_waits_for_the_dispatched_notification() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    let (status, _, _) = send_request(
        &router,
        "POST",
        "/messages/?id=a9173c7d-038c-4101-b547-939c25d8053e",
        Some(text_body("bob@example.org", "hi")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn failure_notifications_map_reason_codes_onto_statuses() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    let uri = format!("/messages/?id={}", Uuid::new_v4());
    let (status, _, _) = send_request(
        &router,
        "POST",
        &uri,
        Some(text_body("bob@example.org", "fail-validation")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let uri = format!("/messages/?id={}", Uuid::new_v4());
    let (status, _, _) = send_request(
        &router,
        "POST",
        &uri,
        Some(text_body("bob@example.org", "fail-auth")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn get_command_returns_the_serialized_resource() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    let (status, headers, body) = send_request(&router, "GET", "/commands/ping/", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("application/vnd.lime.ping+json")
    );
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn unknown_command_resource_maps_the_failure_reason() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    let (status, _, _) = send_request(&router, "GET", "/commands/presence/", None).await;
    // Reason code 33 is outside the session/validation ranges.
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn empty_storage_lists_as_no_content_and_long_poll_times_out() {
    let listener = test_listener(Duration::from_millis(300));
    spawn_host(listener.clone());
    let router = listener.router();

    let (status, _, _) = send_request(&router, "GET", "/storage/messages/", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = send_request(&router, "GET", "/messages/", None).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
}

#[tokio::test]
async fn long_poll_dequeues_a_stored_message() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    // A message routed toward alice lands in her storage.
    let alice: Identity = "alice@example.org".parse().unwrap();
    let (status, _, _) = send_request(
        &router,
        "POST",
        "/messages/",
        Some(text_body("alice@example.org", "to self")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, body) = send_request(&router, "GET", "/messages/", None).await;
    assert_eq!(status, StatusCode::OK);
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["content"], json!("to self"));

    // Dequeued means gone.
    assert!(listener
        .message_storage()
        .get_ids(&alice)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn stored_message_can_be_listed_and_deleted() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    let (status, _, _) = send_request(
        &router,
        "POST",
        "/messages/",
        Some(text_body("alice@example.org", "keep me")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut ids: Vec<Uuid> = Vec::new();
    for _ in 0..50 {
        let (status, _, body) = send_request(&router, "GET", "/storage/messages/", None).await;
        if status == StatusCode::OK {
            ids = serde_json::from_slice(&body).unwrap();
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ids.len(), 1);

    let uri = format!("/storage/messages/{}", ids[0]);
    let (status, _, _) = send_request(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = send_request(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn intermediate_notifications_are_stored_for_polling() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    let uri = format!("/messages/?id={}", Uuid::new_v4());
    let (status, _, _) = send_request(
        &router,
        "POST",
        &uri,
        Some(text_body("bob@example.org", "notify-me")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, body) = send_request(&router, "GET", "/storage/notifications/", None).await;
    assert_eq!(status, StatusCode::OK);
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["event"], json!("received"));
}

#[tokio::test]
async fn notification_can_be_injected_toward_the_server() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    let uri = format!("/notifications/?id={}", Uuid::new_v4());
    let (status, _, _) = send_request(
        &router,
        "POST",
        &uri,
        Some(json!({ "event": "consumed" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn missing_credentials_are_challenged() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    let request = Request::builder()
        .method("GET")
        .uri("/storage/messages/")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_some());
}

#[tokio::test]
async fn registered_document_schemas_are_enforced() {
    let listener = test_listener(Duration::from_secs(5));
    spawn_host(listener.clone());
    let router = listener.router();

    // The ping schema is an empty object; a bare string must be rejected.
    let (status, _, _) = send_request(
        &router,
        "POST",
        "/messages/",
        Some(json!({
            "to": "bob@example.org",
            "type": "application/vnd.lime.ping+json",
            "content": "not-a-ping"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unregistered media types pass through opaque.
    let (status, _, _) = send_request(
        &router,
        "POST",
        "/messages/",
        Some(json!({
            "to": "bob@example.org",
            "type": "application/x-custom+json",
            "content": { "anything": true }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
