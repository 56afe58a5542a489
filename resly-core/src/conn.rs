use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnError;

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub subject: String,
    /// Reply inbox, present on request messages.
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

/// Connection lifecycle notifications surfaced by a [`Conn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// The client re-established its connection. Subscriptions are expected
    /// to survive the reconnect.
    Reconnected,
    /// The client lost its connection and is retrying.
    Disconnected,
    /// The connection is permanently gone.
    Closed,
}

/// The minimal broker capability the framework consumes.
///
/// The core never talks to a concrete broker client; `resly-nats` adapts
/// `async-nats` to this trait and the test harness provides an in-process
/// double.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Publishes a payload to a subject.
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), ConnError>;

    /// Subscribes to a subject (which may contain `*`/`>` wildcards) and
    /// delivers matching messages into `tx` until unsubscribed.
    async fn chan_subscribe(
        &self,
        subject: &str,
        tx: mpsc::Sender<RawMessage>,
    ) -> Result<Box<dyn Subscription>, ConnError>;

    /// Registers a channel receiving connection lifecycle events.
    fn watch_events(&self, tx: mpsc::UnboundedSender<ConnEvent>);

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

/// Handle to an active subscription created by [`Conn::chan_subscribe`].
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn unsubscribe(self: Box<Self>) -> Result<(), ConnError>;
}
