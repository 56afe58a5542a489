//! NATS broker adapter for Resly.
//!
//! [`NatsConn`] maps the framework's [`Conn`] capability onto
//! [`async-nats`]: publishes go straight to the client, subscriptions are
//! forwarded into the service's inbound channel by a per-subscription task,
//! and client connection events are fanned out to the service's watchers.
//!
//! [`async-nats`]: https://docs.rs/async-nats

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use resly_core::{Conn, ConnError, ConnEvent, RawMessage, Subscription};

type Watchers = Arc<Mutex<Vec<mpsc::UnboundedSender<ConnEvent>>>>;

/// A broker connection backed by an `async-nats` client.
pub struct NatsConn {
    client: async_nats::Client,
    watchers: Watchers,
    closed: CancellationToken,
}

impl NatsConn {
    /// Connects to a NATS server.
    pub async fn connect(url: &str) -> Result<NatsConn, ConnError> {
        let watchers: Watchers = Arc::new(Mutex::new(Vec::new()));
        let cb_watchers = watchers.clone();
        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let watchers = cb_watchers.clone();
                async move {
                    // The initial connect completes before the service
                    // registers a watcher, so a Connected event seen here is
                    // a reconnect.
                    let mapped = match event {
                        async_nats::Event::Connected => Some(ConnEvent::Reconnected),
                        async_nats::Event::Disconnected => Some(ConnEvent::Disconnected),
                        async_nats::Event::Closed => Some(ConnEvent::Closed),
                        _ => None,
                    };
                    if let Some(ev) = mapped {
                        debug!(?ev, "nats connection event");
                        watchers.lock().unwrap().retain(|tx| tx.send(ev).is_ok());
                    }
                }
            })
            .connect(url)
            .await
            .map_err(|e| ConnError::Other(e.to_string()))?;
        Ok(NatsConn {
            client,
            watchers,
            closed: CancellationToken::new(),
        })
    }

    /// Wraps an already-connected client. Connection events are not
    /// surfaced unless the client was built with an event callback feeding
    /// [`watch_events`](Conn::watch_events) watchers.
    pub fn from_client(client: async_nats::Client) -> NatsConn {
        NatsConn {
            client,
            watchers: Arc::new(Mutex::new(Vec::new())),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Conn for NatsConn {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), ConnError> {
        self.client
            .publish(subject.to_string(), Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| ConnError::Publish(e.to_string()))
    }

    async fn chan_subscribe(
        &self,
        subject: &str,
        tx: mpsc::Sender<RawMessage>,
    ) -> Result<Box<dyn Subscription>, ConnError> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| ConnError::Subscribe(e.to_string()))?;
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let closed = self.closed.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = closed.cancelled() => break,
                    msg = subscriber.next() => match msg {
                        Some(msg) => {
                            let raw = RawMessage {
                                subject: msg.subject.to_string(),
                                reply: msg.reply.map(|r| r.to_string()),
                                payload: msg.payload.to_vec(),
                            };
                            if tx.send(raw).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                error!("unsubscribe failed: {e}");
            }
        });
        Ok(Box::new(NatsSubscription { stop, task }))
    }

    fn watch_events(&self, tx: mpsc::UnboundedSender<ConnEvent>) {
        self.watchers.lock().unwrap().push(tx);
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Err(e) = self.client.drain().await {
            error!("drain failed: {e}");
        }
        let watchers = std::mem::take(&mut *self.watchers.lock().unwrap());
        for tx in &watchers {
            let _ = tx.send(ConnEvent::Closed);
        }
    }
}

struct NatsSubscription {
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), ConnError> {
        self.stop.cancel();
        let _ = self.task.await;
        Ok(())
    }
}
