use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use lime::channel::client::{establish, ClientEstablishment};
use lime::channel::on_demand::{ChannelFailure, ChannelListener, OnDemandClientChannel};
use lime::channel::server::{accept, GuestAuthenticator, ServerEstablishment};
use lime::channel::{Channel, ChannelConfig};
use lime::envelope::{AuthenticationScheme, Message, PlainText, TypedDocument};
use lime::error::LimeError;
use lime::transport::PairTransport;

type ServerChannels = Arc<parking_lot::Mutex<Vec<Arc<Channel>>>>;

/// Builds a connected channel pair and parks the server side for the test.
async fn connect_pair(servers: ServerChannels) -> Result<Arc<Channel>, LimeError> {
    let (client_end, server_end) = PairTransport::pair(8);
    let server = tokio::spawn(async move {
        accept(
            Arc::new(server_end),
            ChannelConfig::default(),
            ServerEstablishment::new(
                "server@example.org/srv1".parse().unwrap(),
                vec![AuthenticationScheme::Guest],
            ),
            Arc::new(GuestAuthenticator),
            &CancellationToken::new(),
        )
        .await
    });
    let client = establish(
        Arc::new(client_end),
        ChannelConfig::default(),
        ClientEstablishment::guest("alice@example.org".parse().unwrap()),
        &CancellationToken::new(),
    )
    .await?;
    let server = server
        .await
        .map_err(|err| LimeError::Transport(err.to_string()))??;
    servers.lock().push(server);
    Ok(client)
}

#[derive(Default)]
struct RecordingListener {
    events: parking_lot::Mutex<Vec<&'static str>>,
    handle_creation_failures: bool,
    handle_operation_failures: bool,
}

impl RecordingListener {
    fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ChannelListener for RecordingListener {
    async fn channel_created(&self, _channel: &Arc<Channel>) {
        self.events.lock().push("created");
    }

    async fn channel_discarded(&self) {
        self.events.lock().push("discarded");
    }

    async fn channel_creation_failed(&self, failure: &ChannelFailure) {
        self.events.lock().push("creation_failed");
        if self.handle_creation_failures {
            failure.set_handled();
        }
    }

    async fn channel_operation_failed(&self, failure: &ChannelFailure) {
        self.events.lock().push("operation_failed");
        if self.handle_operation_failures {
            failure.set_handled();
        }
    }
}

fn test_message(body: &str) -> Message {
    Message::fire_and_forget(
        "server@example.org/srv1".parse().unwrap(),
        PlainText(body.into()).into_document().unwrap(),
    )
}

#[tokio::test]
async fn creation_failure_is_retried_when_handled() {
    let servers: ServerChannels = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicUsize::new(0));

    let builder_servers = servers.clone();
    let builder_attempts = attempts.clone();
    let on_demand = OnDemandClientChannel::from_fn(move || {
        let servers = builder_servers.clone();
        let attempts = builder_attempts.clone();
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(LimeError::Transport("first attempt fails".into()));
            }
            connect_pair(servers).await
        }
    });
    let listener = Arc::new(RecordingListener {
        handle_creation_failures: true,
        ..RecordingListener::default()
    });
    on_demand.add_listener(listener.clone());

    let ct = CancellationToken::new();
    on_demand
        .send_message(test_message("hello"), &ct)
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let events = listener.events();
    assert_eq!(events, vec!["creation_failed", "created"]);
    assert!(on_demand.is_established());
}

#[tokio::test]
async fn unhandled_creation_failure_propagates() {
    let on_demand = OnDemandClientChannel::from_fn(|| async {
        Err(LimeError::Transport("nothing listening".into()))
    });
    let listener = Arc::new(RecordingListener::default());
    on_demand.add_listener(listener.clone());

    let result = on_demand
        .send_message(test_message("hello"), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(LimeError::Transport(_))));
    assert_eq!(listener.events(), vec!["creation_failed"]);
}

#[tokio::test]
async fn operation_failure_discards_and_rebuilds() {
    let servers: ServerChannels = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let builder_servers = servers.clone();
    let on_demand = OnDemandClientChannel::from_fn(move || {
        let servers = builder_servers.clone();
        async move { connect_pair(servers).await }
    });
    let listener = Arc::new(RecordingListener {
        handle_operation_failures: true,
        ..RecordingListener::default()
    });
    on_demand.add_listener(listener.clone());

    let ct = CancellationToken::new();
    let id = uuid::Uuid::new_v4();
    let mut first = test_message("first");
    first.id = Some(id);
    on_demand.send_message(first, &ct).await.unwrap();

    // Reusing an envelope id is a protocol error on the inner channel; the
    // listener marks it handled, so the handle discards the channel and the
    // send succeeds on a fresh one.
    let mut second = test_message("second");
    second.id = Some(id);
    on_demand.send_message(second, &ct).await.unwrap();

    let events = listener.events();
    assert_eq!(events.iter().filter(|event| **event == "created").count(), 2);
    assert_eq!(
        events
            .iter()
            .filter(|event| **event == "operation_failed")
            .count(),
        1
    );
    assert!(events.contains(&"discarded"));
}

#[tokio::test]
async fn dead_channel_is_replaced_on_next_send() {
    let servers: ServerChannels = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let builder_servers = servers.clone();
    let on_demand = OnDemandClientChannel::from_fn(move || {
        let servers = builder_servers.clone();
        async move { connect_pair(servers).await }
    });
    let listener = Arc::new(RecordingListener {
        handle_operation_failures: true,
        ..RecordingListener::default()
    });
    on_demand.add_listener(listener.clone());

    let ct = CancellationToken::new();
    on_demand
        .send_message(test_message("first"), &ct)
        .await
        .unwrap();

    // Tear down the server side and wait for the client channel to notice.
    let server = servers.lock()[0].clone();
    server.close().await;
    for _ in 0..100 {
        if !on_demand.is_established() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    on_demand
        .send_message(test_message("second"), &ct)
        .await
        .unwrap();

    let events = listener.events();
    assert_eq!(events.iter().filter(|event| **event == "created").count(), 2);
    assert!(events.contains(&"discarded"));
}

#[tokio::test]
async fn caller_cancellation_skips_the_retry_loop() {
    let servers: ServerChannels = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let builder_servers = servers.clone();
    let on_demand = OnDemandClientChannel::from_fn(move || {
        let servers = builder_servers.clone();
        async move { connect_pair(servers).await }
    });
    let listener = Arc::new(RecordingListener {
        handle_operation_failures: true,
        ..RecordingListener::default()
    });
    on_demand.add_listener(listener.clone());

    let ct = CancellationToken::new();
    let receive = {
        let ct = ct.clone();
        let on_demand = Arc::new(on_demand);
        let handle = on_demand.clone();
        tokio::spawn(async move { handle.receive_message(&ct).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    ct.cancel();
    let result = receive.await.unwrap();
    assert!(matches!(result, Err(LimeError::Cancelled)));
    // Cancellation is not a channel failure.
    assert!(!listener.events().contains(&"operation_failed"));
}

#[tokio::test]
async fn disposed_handle_rejects_operations() {
    let servers: ServerChannels = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let builder_servers = servers.clone();
    let on_demand = OnDemandClientChannel::from_fn(move || {
        let servers = builder_servers.clone();
        async move { connect_pair(servers).await }
    });

    let ct = CancellationToken::new();
    on_demand
        .send_message(test_message("hello"), &ct)
        .await
        .unwrap();
    on_demand.finish(&ct).await.unwrap();

    let result = on_demand.send_message(test_message("late"), &ct).await;
    assert!(matches!(result, Err(LimeError::Disposed)));
}
