//! In-process test harness for Resly services.
//!
//! [`MockConn`] is a broker double implementing the framework's [`Conn`]
//! capability entirely in memory: subscriptions match with NATS wildcard
//! semantics, requests are driven with [`MockConn::request`], and every
//! publish the service makes is observable through
//! [`MockConn::next_published`].
//!
//! [`TestFixture`] wires a [`Service`] to a [`MockConn`], serves it on a
//! background task, and waits until the service is started.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use resly_core::{Conn, ConnError, ConnEvent, Pattern, RawMessage, Service, Subscription};

const HARNESS_TIMEOUT: Duration = Duration::from_secs(5);

struct MockSub {
    subject: String,
    tx: mpsc::Sender<RawMessage>,
}

struct MockInner {
    subs: Mutex<Vec<MockSub>>,
    // Reply-inbox waiters for in-flight requests.
    waiters: Mutex<HashMap<String, mpsc::UnboundedSender<RawMessage>>>,
    published_tx: mpsc::UnboundedSender<RawMessage>,
    published_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawMessage>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<ConnEvent>>>,
    closed: AtomicBool,
    next_inbox: AtomicU64,
}

/// An in-memory broker connection double.
#[derive(Clone)]
pub struct MockConn {
    inner: Arc<MockInner>,
}

impl Default for MockConn {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConn {
    pub fn new() -> MockConn {
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        MockConn {
            inner: Arc::new(MockInner {
                subs: Mutex::new(Vec::new()),
                waiters: Mutex::new(HashMap::new()),
                published_tx,
                published_rx: tokio::sync::Mutex::new(published_rx),
                watchers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                next_inbox: AtomicU64::new(0),
            }),
        }
    }

    /// Sends a request to the service and waits for its reply, skipping
    /// out-of-band `timeout:"…"` directives.
    ///
    /// # Panics
    ///
    /// Panics when no subscription matches the subject or no reply arrives
    /// within the harness timeout.
    pub async fn request(&self, subject: &str, payload: Value) -> Value {
        let raw = self
            .request_raw(subject, serde_json::to_vec(&payload).unwrap())
            .await;
        serde_json::from_slice(&raw.payload)
            .unwrap_or_else(|e| panic!("malformed reply to {subject}: {e}"))
    }

    /// Like [`request`](MockConn::request), returning the raw reply.
    pub async fn request_raw(&self, subject: &str, payload: Vec<u8>) -> RawMessage {
        let inbox = format!(
            "_MOCK_INBOX.{}",
            self.inner.next_inbox.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner
            .waiters
            .lock()
            .unwrap()
            .insert(inbox.clone(), tx);

        let delivered = self
            .deliver(RawMessage {
                subject: subject.to_string(),
                reply: Some(inbox.clone()),
                payload,
            })
            .await;
        assert!(delivered, "no subscription matches {subject}");

        let reply = loop {
            let msg = tokio::time::timeout(HARNESS_TIMEOUT, rx.recv())
                .await
                .unwrap_or_else(|_| panic!("no reply to {subject}"))
                .expect("mock connection dropped");
            if msg.payload.starts_with(b"timeout:\"") {
                trace!(%subject, "timeout directive");
                continue;
            }
            break msg;
        };
        self.inner.waiters.lock().unwrap().remove(&inbox);
        reply
    }

    /// Delivers a message without a reply subject to matching
    /// subscriptions. Returns whether any subscription matched.
    pub async fn inject(&self, subject: &str, payload: Value) -> bool {
        self.deliver(RawMessage {
            subject: subject.to_string(),
            reply: None,
            payload: serde_json::to_vec(&payload).unwrap(),
        })
        .await
    }

    /// The next message the service published, in publish order.
    ///
    /// # Panics
    ///
    /// Panics when nothing is published within the harness timeout.
    pub async fn next_published(&self) -> RawMessage {
        let mut rx = self.inner.published_rx.lock().await;
        tokio::time::timeout(HARNESS_TIMEOUT, rx.recv())
            .await
            .expect("no message published")
            .expect("mock connection dropped")
    }

    /// The next published message, or `None` when nothing arrives within
    /// `wait`.
    pub async fn try_next_published(&self, wait: Duration) -> Option<RawMessage> {
        let mut rx = self.inner.published_rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    /// Subjects of the currently active subscriptions.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .subs
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.subject.clone())
            .collect()
    }

    /// Signals a broker reconnect to every watcher.
    pub fn reconnect(&self) {
        self.send_event(ConnEvent::Reconnected);
    }

    /// Signals a lost connection to every watcher.
    pub fn disconnect(&self) {
        self.send_event(ConnEvent::Disconnected);
    }

    fn send_event(&self, ev: ConnEvent) {
        self.inner
            .watchers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(ev).is_ok());
    }

    async fn deliver(&self, msg: RawMessage) -> bool {
        let matching: Vec<mpsc::Sender<RawMessage>> = {
            let subs = self.inner.subs.lock().unwrap();
            subs.iter()
                .filter(|s| Pattern::new(s.subject.clone()).matches(&msg.subject))
                .map(|s| s.tx.clone())
                .collect()
        };
        let mut delivered = false;
        for tx in matching {
            if tx.send(msg.clone()).await.is_ok() {
                delivered = true;
            }
        }
        delivered
    }
}

#[async_trait]
impl Conn for MockConn {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), ConnError> {
        let msg = RawMessage {
            subject: subject.to_string(),
            reply: None,
            payload: payload.to_vec(),
        };
        let waiter = self.inner.waiters.lock().unwrap().get(subject).cloned();
        match waiter {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => {
                let _ = self.inner.published_tx.send(msg);
            }
        }
        Ok(())
    }

    async fn chan_subscribe(
        &self,
        subject: &str,
        tx: mpsc::Sender<RawMessage>,
    ) -> Result<Box<dyn Subscription>, ConnError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ConnError::Closed);
        }
        self.inner.subs.lock().unwrap().push(MockSub {
            subject: subject.to_string(),
            tx,
        });
        Ok(Box::new(MockSubscription {
            conn: self.inner.clone(),
            subject: subject.to_string(),
        }))
    }

    fn watch_events(&self, tx: mpsc::UnboundedSender<ConnEvent>) {
        self.inner.watchers.lock().unwrap().push(tx);
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the subscription senders closes the service's inbound
        // channel.
        self.inner.subs.lock().unwrap().clear();
        let watchers = std::mem::take(&mut *self.inner.watchers.lock().unwrap());
        for tx in &watchers {
            let _ = tx.send(ConnEvent::Closed);
        }
    }
}

struct MockSubscription {
    conn: Arc<MockInner>,
    subject: String,
}

#[async_trait]
impl Subscription for MockSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), ConnError> {
        let mut subs = self.conn.subs.lock().unwrap();
        if let Some(pos) = subs.iter().position(|s| s.subject == self.subject) {
            subs.remove(pos);
        }
        Ok(())
    }
}

/// A service served over a [`MockConn`] on a background task.
pub struct TestFixture {
    pub service: Service,
    pub conn: MockConn,
    /// The `system.reset` message published at start.
    pub reset: RawMessage,
    serve_task: tokio::task::JoinHandle<Result<(), resly_core::ServiceError>>,
}

impl TestFixture {
    /// Serves `service` over a fresh [`MockConn`] and waits until it is
    /// started. Installs its own on-serve callback; tests needing one
    /// should wire the fixture by hand.
    ///
    /// # Panics
    ///
    /// Panics when the service does not start within the harness timeout.
    pub async fn start(service: Service) -> TestFixture {
        let conn = MockConn::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        service.set_on_serve(move |_s| {
            let _ = tx.send(());
        });
        let serve_service = service.clone();
        let serve_conn = conn.clone();
        let serve_task = tokio::spawn(async move { serve_service.serve(serve_conn).await });
        tokio::time::timeout(HARNESS_TIMEOUT, rx.recv())
            .await
            .expect("service did not start")
            .expect("serve task ended before starting");
        let reset = conn.next_published().await;
        assert_eq!(reset.subject, "system.reset");
        TestFixture {
            service,
            conn,
            reset,
            serve_task,
        }
    }

    /// Shuts the service down and waits for the serve task to finish.
    pub async fn shutdown(self) {
        self.service.shutdown().await.expect("shutdown failed");
        tokio::time::timeout(HARNESS_TIMEOUT, self.serve_task)
            .await
            .expect("serve task did not finish")
            .expect("serve task panicked")
            .expect("serve returned an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_conn_routes_replies_to_waiters() {
        let conn = MockConn::new();
        let (tx, mut rx) = mpsc::channel(8);
        let _sub = conn.chan_subscribe("call.math.*", tx).await.unwrap();

        let driver = conn.clone();
        let request = tokio::spawn(async move {
            driver
                .request("call.math.double", serde_json::json!({"params": {"value": 21}}))
                .await
        });

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.subject, "call.math.double");
        let reply = msg.reply.unwrap();
        conn.publish(&reply, br#"{"result":42}"#).await.unwrap();

        let reply = request.await.unwrap();
        assert_eq!(reply["result"], 42);
    }

    #[tokio::test]
    async fn published_events_are_observable_in_order(){
        let conn = MockConn::new();
        conn.publish("event.a.change", b"{}").await.unwrap();
        conn.publish("event.b.change", b"{}").await.unwrap();
        assert_eq!(conn.next_published().await.subject, "event.a.change");
        assert_eq!(conn.next_published().await.subject, "event.b.change");
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscription() {
        let conn = MockConn::new();
        let (tx, _rx) = mpsc::channel(8);
        let sub = conn.chan_subscribe("get.a", tx).await.unwrap();
        assert_eq!(conn.subscriptions(), vec!["get.a"]);
        sub.unsubscribe().await.unwrap();
        assert!(conn.subscriptions().is_empty());
    }
}
