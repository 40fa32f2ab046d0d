//! Durable client handle that rebuilds its channel on demand.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::Channel;
use crate::envelope::{Command, Message, Notification};
use crate::error::LimeError;

/// Factory invoked (under the build mutex) whenever a fresh channel is
/// needed.
pub type ChannelBuilder =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<Channel>, LimeError>> + Send + Sync>;

/// A failure surfaced to listeners; marking it handled asks the owning
/// handle to discard the channel and retry.
#[derive(Debug)]
pub struct ChannelFailure {
    pub error: LimeError,
    handled: AtomicBool,
}

impl ChannelFailure {
    fn new(error: LimeError) -> Self {
        Self {
            error,
            handled: AtomicBool::new(false),
        }
    }

    pub fn set_handled(&self) {
        self.handled.store(true, Ordering::SeqCst);
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }
}

/// Observer of the on-demand channel lifecycle.
///
/// Callbacks run in registration order and the handle awaits each one, so a
/// listener may defer the retry decision on asynchronous work (logging,
/// credential refresh) before returning.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    async fn channel_created(&self, _channel: &Arc<Channel>) {}

    async fn channel_discarded(&self) {}

    async fn channel_creation_failed(&self, _failure: &ChannelFailure) {}

    async fn channel_operation_failed(&self, _failure: &ChannelFailure) {}
}

/// Lazily-established client channel with transparent reconnection.
///
/// # Guarantees
/// * Establishment is serialized by a single-permit mutex; operations touch
///   it only while building or discarding, never on the normal path.
/// * Send operations require an established channel; receive operations
///   accept any current channel so buffered envelopes drain after a close.
/// * The caller's cancellation token always propagates as `Cancelled` and
///   never triggers the retry loop.
pub struct OnDemandClientChannel {
    builder: ChannelBuilder,
    current: parking_lot::RwLock<Option<Arc<Channel>>>,
    build_mutex: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    listeners: parking_lot::RwLock<Vec<Arc<dyn ChannelListener>>>,
}

impl OnDemandClientChannel {
    pub fn new(builder: ChannelBuilder) -> Self {
        Self {
            builder,
            current: parking_lot::RwLock::new(None),
            build_mutex: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
            listeners: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn from_fn<F, Fut>(builder: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<Channel>, LimeError>> + Send + 'static,
    {
        Self::new(Arc::new(move || Box::pin(builder())))
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_established(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .map(|channel| channel.is_established())
            .unwrap_or(false)
    }

    pub async fn send_message(
        &self,
        message: Message,
        ct: &CancellationToken,
    ) -> Result<(), LimeError> {
        let op_ct = ct.clone();
        self.execute(ct, true, move |channel| {
            let message = message.clone();
            let ct = op_ct.clone();
            Box::pin(async move { channel.send_message(message, &ct).await })
        })
        .await
    }

    pub async fn receive_message(&self, ct: &CancellationToken) -> Result<Message, LimeError> {
        let op_ct = ct.clone();
        self.execute(ct, false, move |channel| {
            let ct = op_ct.clone();
            Box::pin(async move { channel.receive_message(&ct).await })
        })
        .await
    }

    pub async fn send_notification(
        &self,
        notification: Notification,
        ct: &CancellationToken,
    ) -> Result<(), LimeError> {
        let op_ct = ct.clone();
        self.execute(ct, true, move |channel| {
            let notification = notification.clone();
            let ct = op_ct.clone();
            Box::pin(async move { channel.send_notification(notification, &ct).await })
        })
        .await
    }

    pub async fn receive_notification(
        &self,
        ct: &CancellationToken,
    ) -> Result<Notification, LimeError> {
        let op_ct = ct.clone();
        self.execute(ct, false, move |channel| {
            let ct = op_ct.clone();
            Box::pin(async move { channel.receive_notification(&ct).await })
        })
        .await
    }

    pub async fn send_command(
        &self,
        command: Command,
        ct: &CancellationToken,
    ) -> Result<(), LimeError> {
        let op_ct = ct.clone();
        self.execute(ct, true, move |channel| {
            let command = command.clone();
            let ct = op_ct.clone();
            Box::pin(async move { channel.send_command(command, &ct).await })
        })
        .await
    }

    pub async fn receive_command(&self, ct: &CancellationToken) -> Result<Command, LimeError> {
        let op_ct = ct.clone();
        self.execute(ct, false, move |channel| {
            let ct = op_ct.clone();
            Box::pin(async move { channel.receive_command(&ct).await })
        })
        .await
    }

    /// Gracefully finishes the current channel (when established) and marks
    /// the handle disposed; every later operation fails with `Disposed`.
    pub async fn finish(&self, ct: &CancellationToken) -> Result<(), LimeError> {
        self.disposed.store(true, Ordering::SeqCst);
        let current = self.current.write().take();
        if let Some(channel) = current {
            if channel.is_established() {
                let _ = channel.finish(ct).await;
            }
            channel.close().await;
            self.notify_discarded().await;
        }
        Ok(())
    }

    async fn execute<T>(
        &self,
        ct: &CancellationToken,
        require_established: bool,
        op: impl Fn(Arc<Channel>) -> BoxFuture<'static, Result<T, LimeError>>,
    ) -> Result<T, LimeError> {
        loop {
            if self.disposed.load(Ordering::SeqCst) {
                return Err(LimeError::Disposed);
            }
            if ct.is_cancelled() {
                return Err(LimeError::Cancelled);
            }
            let channel = self.get_or_build(require_established, ct).await?;
            match op(channel.clone()).await {
                Ok(value) => return Ok(value),
                // The caller's own token; never retried.
                Err(LimeError::Cancelled) => return Err(LimeError::Cancelled),
                Err(error) => {
                    debug!(target: "lime::on_demand", %error, "channel operation failed");
                    let failure = ChannelFailure::new(error.clone());
                    self.notify_operation_failed(&failure).await;
                    self.discard(&channel).await;
                    if failure.is_handled() {
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn get_or_build(
        &self,
        require_established: bool,
        ct: &CancellationToken,
    ) -> Result<Arc<Channel>, LimeError> {
        if let Some(channel) = self.usable(require_established) {
            return Ok(channel);
        }

        let _permit = self.build_mutex.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Err(LimeError::Disposed);
        }
        if let Some(channel) = self.usable(require_established) {
            return Ok(channel);
        }

        // A dead channel occupying the slot is discarded before rebuilding.
        let stale = self.current.write().take();
        if let Some(stale) = stale {
            self.notify_discarded().await;
            stale.close().await;
        }

        loop {
            if ct.is_cancelled() {
                return Err(LimeError::Cancelled);
            }
            let built = tokio::select! {
                biased;
                _ = ct.cancelled() => return Err(LimeError::Cancelled),
                built = (self.builder)() => built,
            };
            match built {
                Ok(channel) => {
                    *self.current.write() = Some(channel.clone());
                    self.notify_created(&channel).await;
                    return Ok(channel);
                }
                Err(error) => {
                    debug!(target: "lime::on_demand", %error, "channel creation failed");
                    let failure = ChannelFailure::new(error.clone());
                    self.notify_creation_failed(&failure).await;
                    if failure.is_handled() {
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    fn usable(&self, require_established: bool) -> Option<Arc<Channel>> {
        let guard = self.current.read();
        match guard.as_ref() {
            Some(channel) if !require_established || channel.is_established() => {
                Some(channel.clone())
            }
            _ => None,
        }
    }

    async fn discard(&self, channel: &Arc<Channel>) {
        let removed = {
            let mut guard = self.current.write();
            match guard.as_ref() {
                Some(current) if Arc::ptr_eq(current, channel) => guard.take(),
                _ => None,
            }
        };
        if removed.is_some() {
            self.notify_discarded().await;
        }
        channel.close().await;
    }

    fn listeners(&self) -> Vec<Arc<dyn ChannelListener>> {
        self.listeners.read().clone()
    }

    async fn notify_created(&self, channel: &Arc<Channel>) {
        for listener in self.listeners() {
            listener.channel_created(channel).await;
        }
    }

    async fn notify_discarded(&self) {
        for listener in self.listeners() {
            listener.channel_discarded().await;
        }
    }

    async fn notify_creation_failed(&self, failure: &ChannelFailure) {
        for listener in self.listeners() {
            listener.channel_creation_failed(failure).await;
        }
    }

    async fn notify_operation_failed(&self, failure: &ChannelFailure) {
        for listener in self.listeners() {
            listener.channel_operation_failed(failure).await;
        }
    }
}
