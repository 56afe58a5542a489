use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::codec::{self, SystemReset};
use crate::conn::{Conn, ConnEvent, RawMessage, Subscription};
use crate::dispatch::{dispatch, Thunk, WorkQueues};
use crate::error::ServiceError;
use crate::event::ResourceEvent;
use crate::handler::Handler;
use crate::mux::{Match, Mux};
use crate::pattern::{is_valid_rname, part_kind, PartKind, Pattern};
use crate::query::QueryEventState;
use crate::resource::Resource;

/// The RES protocol version the service implements.
pub const PROTOCOL_VERSION: &str = "1.2.0";

const DEFAULT_WORKER_COUNT: usize = 32;
const DEFAULT_IN_CHANNEL_SIZE: usize = 256;

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;
const STOPPING: u8 = 3;

type ServiceCallback = Arc<dyn Fn(&Service) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Service, &str) + Send + Sync>;

struct Options {
    worker_count: usize,
    in_channel_size: usize,
    query_event_duration: Duration,
    reset_resources: Option<Vec<String>>,
    reset_access: Option<Vec<String>>,
    on_serve: Option<ServiceCallback>,
    on_disconnect: Option<ServiceCallback>,
    on_reconnect: Option<ServiceCallback>,
    on_error: Option<ErrorCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            worker_count: DEFAULT_WORKER_COUNT,
            in_channel_size: DEFAULT_IN_CHANNEL_SIZE,
            query_event_duration: crate::query::DEFAULT_QUERY_EVENT_DURATION,
            reset_resources: None,
            reset_access: None,
            on_serve: None,
            on_disconnect: None,
            on_reconnect: None,
            on_error: None,
        }
    }
}

enum BrokerOp {
    Publish {
        subject: String,
        payload: Vec<u8>,
    },
    Subscribe {
        subject: String,
        tx: mpsc::Sender<RawMessage>,
    },
    Unsubscribe {
        subject: String,
    },
}

struct Runtime {
    conn: Arc<dyn Conn>,
    out_tx: mpsc::UnboundedSender<BrokerOp>,
    // Dropped at shutdown so the inbound channel can close.
    in_tx: Option<mpsc::Sender<RawMessage>>,
    // Keeps the control channel open until the runtime is torn down.
    _ctrl_tx: mpsc::UnboundedSender<ConnEvent>,
    work: Arc<WorkQueues>,
    cancel: CancellationToken,
    handle: tokio::runtime::Handle,
    reset_resources: Vec<String>,
    reset_access: Vec<String>,
    query_event_duration: Duration,
}

struct ServiceInner {
    name: String,
    state: AtomicU8,
    mux: RwLock<Mux>,
    opts: Mutex<Options>,
    runtime: Mutex<Option<Runtime>>,
    queries: Mutex<HashMap<String, Arc<QueryEventState>>>,
    done: Mutex<Option<watch::Receiver<bool>>>,
}

/// A RES service: a handler registry and the machinery serving it over a
/// broker connection.
///
/// `Service` is a cheap clonable handle; clones share the same underlying
/// service.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

#[derive(Clone)]
pub(crate) struct WeakService {
    inner: Weak<ServiceInner>,
}

impl WeakService {
    pub(crate) fn upgrade(&self) -> Option<Service> {
        self.inner.upgrade().map(|inner| Service { inner })
    }
}

impl Service {
    /// Creates a service with the given name. The name becomes the pattern
    /// prefix every handler is registered under; an empty name roots the
    /// service at the whole namespace.
    ///
    /// # Panics
    ///
    /// Panics unless the name is empty or a dot-separated sequence of
    /// valid literal tokens.
    pub fn new(name: impl Into<String>) -> Service {
        let name = name.into();
        if !name.is_empty() && !is_valid_rname(&name) {
            panic!("invalid service name {name:?}");
        }
        let inner = Arc::new(ServiceInner {
            name: name.clone(),
            state: AtomicU8::new(STOPPED),
            mux: RwLock::new(Mux::new(name)),
            opts: Mutex::new(Options::default()),
            runtime: Mutex::new(None),
            queries: Mutex::new(HashMap::new()),
            done: Mutex::new(None),
        });
        let service = Service { inner };
        service
            .inner
            .mux
            .write()
            .unwrap()
            .attach(service.downgrade());
        service
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The RES protocol version the service implements.
    pub fn protocol_version(&self) -> &'static str {
        PROTOCOL_VERSION
    }

    pub(crate) fn downgrade(&self) -> WeakService {
        WeakService {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Registers a handler for a pattern below the service name.
    ///
    /// # Panics
    ///
    /// Panics on an invalid pattern, an invalid group expression, or a
    /// duplicate registration.
    pub fn handle(&self, pattern: &str, handler: Handler) -> &Self {
        self.inner.mux.write().unwrap().add_handler(pattern, handler);
        self
    }

    /// Attaches an event listener for the resources of an exact pattern.
    pub fn add_listener<F>(&self, pattern: &str, f: F) -> &Self
    where
        F: Fn(&ResourceEvent) + Send + Sync + 'static,
    {
        self.inner.mux.write().unwrap().add_listener(pattern, f);
        self
    }

    /// Mounts a sub-router under `path`.
    pub fn mount(&self, path: &str, mux: Mux) -> &Self {
        self.inner.mux.write().unwrap().mount(path, mux);
        self
    }

    /// Creates a sub-router, passes it to `f`, and mounts it under `path`.
    pub fn route<F>(&self, path: &str, f: F) -> &Self
    where
        F: FnOnce(&mut Mux),
    {
        self.inner.mux.write().unwrap().route(path, f);
        self
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// Overrides the inferred owned resource and access pattern lists used
    /// for subscriptions and `system.reset`.
    ///
    /// # Panics
    ///
    /// Panics on invalid patterns or when the service is already serving.
    pub fn set_reset(&self, resources: Vec<String>, access: Vec<String>) -> &Self {
        for p in resources.iter().chain(access.iter()) {
            if !Pattern::new(p.clone()).is_valid() {
                panic!("invalid reset pattern {p:?}");
            }
        }
        self.configure(|opts| {
            opts.reset_resources = Some(resources);
            opts.reset_access = Some(access);
        })
    }

    /// Sets the query-event window duration. Default is 3 seconds.
    ///
    /// # Panics
    ///
    /// Panics on a zero duration or when the service is already serving.
    pub fn set_query_event_duration(&self, duration: Duration) -> &Self {
        if duration.is_zero() {
            panic!("query event duration must be positive");
        }
        self.configure(|opts| opts.query_event_duration = duration)
    }

    /// Sets the worker pool size. Default is 32.
    ///
    /// # Panics
    ///
    /// Panics on zero or when the service is already serving.
    pub fn set_worker_count(&self, count: usize) -> &Self {
        if count == 0 {
            panic!("worker count must be positive");
        }
        self.configure(|opts| opts.worker_count = count)
    }

    /// Sets the inbound channel capacity. Default is 256.
    ///
    /// # Panics
    ///
    /// Panics on zero or when the service is already serving.
    pub fn set_in_channel_size(&self, size: usize) -> &Self {
        if size == 0 {
            panic!("in channel size must be positive");
        }
        self.configure(|opts| opts.in_channel_size = size)
    }

    /// Sets a callback invoked when the service has started serving.
    pub fn set_on_serve<F>(&self, f: F) -> &Self
    where
        F: Fn(&Service) + Send + Sync + 'static,
    {
        self.configure(|opts| opts.on_serve = Some(Arc::new(f)))
    }

    /// Sets a callback invoked when the broker connection is lost.
    pub fn set_on_disconnect<F>(&self, f: F) -> &Self
    where
        F: Fn(&Service) + Send + Sync + 'static,
    {
        self.configure(|opts| opts.on_disconnect = Some(Arc::new(f)))
    }

    /// Sets a callback invoked when the broker connection is
    /// re-established.
    pub fn set_on_reconnect<F>(&self, f: F) -> &Self
    where
        F: Fn(&Service) + Send + Sync + 'static,
    {
        self.configure(|opts| opts.on_reconnect = Some(Arc::new(f)))
    }

    /// Sets a callback invoked on dropped or malformed inbound messages.
    pub fn set_on_error<F>(&self, f: F) -> &Self
    where
        F: Fn(&Service, &str) + Send + Sync + 'static,
    {
        self.configure(|opts| opts.on_error = Some(Arc::new(f)))
    }

    fn configure(&self, f: impl FnOnce(&mut Options)) -> &Self {
        if self.inner.state.load(Ordering::Acquire) != STOPPED {
            panic!("service must be configured before serving");
        }
        f(&mut self.inner.opts.lock().unwrap());
        self
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Subscribes, starts the worker pool, publishes `system.reset`, and
    /// serves requests until [`shutdown`](Service::shutdown) completes or
    /// the broker connection closes.
    pub async fn serve<C: Conn>(&self, conn: C) -> Result<(), ServiceError> {
        let conn: Arc<dyn Conn> = Arc::new(conn);
        if self
            .inner
            .state
            .compare_exchange(STOPPED, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServiceError::AlreadyStarted);
        }
        info!(service = %self.inner.name, "starting service");

        let started = self.start(conn.clone()).await;
        let (mut in_rx, mut ctrl_rx, broker_handle, done_tx, work, cancel, subs) = match started {
            Ok(parts) => parts,
            Err(e) => {
                conn.close().await;
                *self.inner.runtime.lock().unwrap() = None;
                self.inner.state.store(STOPPED, Ordering::Release);
                return Err(e);
            }
        };

        let (on_reconnect, on_disconnect) = {
            let opts = self.inner.opts.lock().unwrap();
            (opts.on_reconnect.clone(), opts.on_disconnect.clone())
        };

        let mut ctrl_done = false;
        let mut closing = false;
        loop {
            tokio::select! {
                biased;
                ev = ctrl_rx.recv(), if !ctrl_done => match ev {
                    Some(ConnEvent::Reconnected) => {
                        info!(service = %self.inner.name, "reconnected; resetting resources");
                        self.publish_reset();
                        if let Some(cb) = &on_reconnect {
                            cb(self);
                        }
                    }
                    Some(ConnEvent::Disconnected) => {
                        info!(service = %self.inner.name, "lost connection");
                        if let Some(cb) = &on_disconnect {
                            cb(self);
                        }
                    }
                    Some(ConnEvent::Closed) => {
                        if !closing {
                            closing = true;
                            let service = self.clone();
                            tokio::spawn(async move {
                                let _ = service.shutdown().await;
                            });
                        }
                    }
                    None => ctrl_done = true,
                },
                msg = in_rx.recv() => match msg {
                    Some(msg) => dispatch(self, msg),
                    None => break,
                },
            }
        }

        // Intake is closed; drain the group queues, flush the outbound
        // queue, then clear state.
        cancel.cancel();
        work.tracker.close();
        work.tracker.wait().await;
        self.inner.queries.lock().unwrap().clear();
        *self.inner.runtime.lock().unwrap() = None;
        let _ = broker_handle.await;
        drop(subs);
        conn.close().await;
        self.inner.state.store(STOPPED, Ordering::Release);
        let _ = done_tx.send(true);
        info!(service = %self.inner.name, "service stopped");
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    async fn start(
        &self,
        conn: Arc<dyn Conn>,
    ) -> Result<
        (
            mpsc::Receiver<RawMessage>,
            mpsc::UnboundedReceiver<ConnEvent>,
            tokio::task::JoinHandle<()>,
            watch::Sender<bool>,
            Arc<WorkQueues>,
            CancellationToken,
            Vec<Box<dyn Subscription>>,
        ),
        ServiceError,
    > {
        if let Err(patterns) = self.inner.mux.read().unwrap().validate_listeners() {
            return Err(ServiceError::InvalidListeners(patterns));
        }

        let (worker_count, in_channel_size, query_event_duration, explicit) = {
            let opts = self.inner.opts.lock().unwrap();
            (
                opts.worker_count,
                opts.in_channel_size,
                opts.query_event_duration,
                (opts.reset_resources.clone(), opts.reset_access.clone()),
            )
        };

        let (resources, access) = {
            let mux = self.inner.mux.read().unwrap();
            let resources = explicit
                .0
                .unwrap_or_else(|| mux.patterns_with(|h| h.has_resource_capability()));
            let access = explicit
                .1
                .unwrap_or_else(|| mux.patterns_with(|h| h.access.is_some()));
            (resources, access)
        };
        let reset_resources: Vec<String> = resources.iter().map(|p| to_subject(p)).collect();
        let reset_access: Vec<String> = access.iter().map(|p| to_subject(p)).collect();
        let subjects = subscription_subjects(&reset_resources, &reset_access);

        let (in_tx, in_rx) = mpsc::channel(in_channel_size);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        conn.watch_events(ctrl_tx.clone());

        let broker_handle = tokio::spawn(broker_loop(conn.clone(), out_rx));

        let mut subs = Vec::with_capacity(subjects.len());
        for subject in &subjects {
            trace!(service = %self.inner.name, %subject, "subscribing");
            let sub = conn.chan_subscribe(subject, in_tx.clone()).await?;
            subs.push(sub);
        }

        let handle = tokio::runtime::Handle::current();
        let work = WorkQueues::new(worker_count, handle.clone());
        let cancel = CancellationToken::new();

        *self.inner.runtime.lock().unwrap() = Some(Runtime {
            conn,
            out_tx,
            in_tx: Some(in_tx),
            _ctrl_tx: ctrl_tx,
            work: work.clone(),
            cancel: cancel.clone(),
            handle,
            reset_resources,
            reset_access,
            query_event_duration,
        });
        *self.inner.done.lock().unwrap() = Some(done_rx);

        // First outbound message after (re)start.
        self.publish_reset();

        self.inner.state.store(STARTED, Ordering::Release);
        info!(service = %self.inner.name, "service started");

        let on_serve = self.inner.opts.lock().unwrap().on_serve.clone();
        if let Some(cb) = on_serve {
            cb(self);
        }

        Ok((in_rx, ctrl_rx, broker_handle, done_tx, work, cancel, subs))
    }

    /// Stops the service: closes the connection, drains every group queue,
    /// and waits until [`serve`](Service::serve) has returned.
    ///
    /// Returns an error when the service is not in the started state.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        if self
            .inner
            .state
            .compare_exchange(STARTED, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServiceError::NotStarted);
        }
        info!(service = %self.inner.name, "stopping service");

        let (cancel, conn) = {
            let mut rt = self.inner.runtime.lock().unwrap();
            let rt = rt.as_mut().expect("runtime missing in started state");
            rt.in_tx = None;
            (rt.cancel.clone(), rt.conn.clone())
        };
        cancel.cancel();
        conn.close().await;
        self.await_done().await;
        Ok(())
    }

    async fn await_done(&self) {
        let rx = self.inner.done.lock().unwrap().clone();
        if let Some(mut rx) = rx {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    // ── Out-of-band execution ───────────────────────────────────────────

    /// Runs `cb` with the resource for `rid` on the worker owning the
    /// resource's group, serialized with its request handlers.
    pub fn with<F>(&self, rid: &str, cb: F) -> Result<(), ServiceError>
    where
        F: FnOnce(Resource) + Send + 'static,
    {
        let (rname, query) = match rid.split_once('?') {
            Some((rname, query)) => (rname, query),
            None => (rid, ""),
        };
        if !is_valid_rname(rname) {
            return Err(ServiceError::InvalidResourceId(rid.to_string()));
        }
        let m = self
            .resolve(rname)
            .ok_or_else(|| ServiceError::NoMatchingHandler(rname.to_string()))?;
        let resource = Resource {
            service: self.clone(),
            rname: rname.to_string(),
            params: Arc::new(m.params),
            query: query.to_string(),
            group: m.group.clone(),
            handler: Some(m.handler),
            listeners: Arc::new(m.listeners),
        };
        self.enqueue_checked(m.group, Box::new(move || cb(resource)))
    }

    /// Runs `cb` on the worker owning `group`.
    pub fn with_group<F>(&self, group: &str, cb: F) -> Result<(), ServiceError>
    where
        F: FnOnce(Service) + Send + 'static,
    {
        let service = self.clone();
        self.enqueue_checked(group.to_string(), Box::new(move || cb(service)))
    }

    /// Runs `cb` on the worker owning the resource's group.
    pub fn with_resource<F>(&self, resource: &Resource, cb: F) -> Result<(), ServiceError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_checked(resource.group().to_string(), Box::new(cb))
    }

    // ── Out-of-band events ──────────────────────────────────────────────

    /// Publishes a token event on `conn.<cid>.token`, resetting the access
    /// token of the connection.
    ///
    /// # Panics
    ///
    /// Panics if `cid` is not a valid single token.
    pub fn token_event<T: Serialize>(&self, cid: &str, token: T) {
        self.send_token_event(cid, token);
    }

    pub(crate) fn send_token_event<T: Serialize>(&self, cid: &str, token: T) {
        if !matches!(part_kind(cid), Some(PartKind::Literal)) {
            panic!("invalid connection ID {cid:?}");
        }
        let payload = match serde_json::to_vec(&codec::TokenEventPayload { token }) {
            Ok(p) => p,
            Err(e) => std::panic::panic_any(crate::error::Error::new(
                crate::error::codes::INTERNAL_ERROR,
                format!("Internal error: failed to serialize token: {e}"),
            )),
        };
        self.publish_out(&format!("conn.{cid}.token"), payload);
    }

    /// Publishes a `system.reset` for the given resource and access
    /// patterns, invalidating gateway caches for them.
    ///
    /// # Panics
    ///
    /// Panics on invalid patterns.
    pub fn reset(&self, resources: Vec<String>, access: Vec<String>) {
        for p in resources.iter().chain(access.iter()) {
            if !Pattern::new(p.clone()).is_valid() {
                panic!("invalid reset pattern {p:?}");
            }
        }
        self.send_reset(
            resources.iter().map(|p| to_subject(p)).collect(),
            access.iter().map(|p| to_subject(p)).collect(),
        );
    }

    fn publish_reset(&self) {
        let lists = {
            let rt = self.inner.runtime.lock().unwrap();
            rt.as_ref()
                .map(|rt| (rt.reset_resources.clone(), rt.reset_access.clone()))
        };
        if let Some((resources, access)) = lists {
            self.send_reset(resources, access);
        }
    }

    fn send_reset(&self, resources: Vec<String>, access: Vec<String>) {
        let reset = SystemReset {
            resources: (!resources.is_empty()).then_some(resources),
            access: (!access.is_empty()).then_some(access),
        };
        match serde_json::to_vec(&reset) {
            Ok(payload) => self.publish_out("system.reset", payload),
            Err(e) => error!("failed to serialize system.reset: {e}"),
        }
    }

    // ── Internal plumbing ───────────────────────────────────────────────

    pub(crate) fn publish_out(&self, subject: &str, payload: Vec<u8>) {
        let rt = self.inner.runtime.lock().unwrap();
        match rt.as_ref() {
            Some(rt) => {
                trace!(service = %self.inner.name, %subject, "publishing");
                let _ = rt.out_tx.send(BrokerOp::Publish {
                    subject: subject.to_string(),
                    payload,
                });
            }
            None => error!(
                service = %self.inner.name,
                %subject,
                "publish dropped: service is not serving"
            ),
        }
    }

    pub(crate) fn resolve(&self, rname: &str) -> Option<Match> {
        self.inner.mux.read().unwrap().get_handler(rname)
    }

    pub(crate) fn enqueue(&self, group: String, thunk: Thunk) {
        if self.enqueue_checked(group, thunk).is_err() {
            error!(service = %self.inner.name, "work dropped: service is not serving");
        }
    }

    fn enqueue_checked(&self, group: String, thunk: Thunk) -> Result<(), ServiceError> {
        let rt = self.inner.runtime.lock().unwrap();
        match rt.as_ref() {
            Some(rt) => {
                rt.work.enqueue(group, thunk);
                Ok(())
            }
            None => Err(ServiceError::NotStarted),
        }
    }

    pub(crate) fn lookup_query(&self, subject: &str) -> Option<Arc<QueryEventState>> {
        self.inner.queries.lock().unwrap().get(subject).cloned()
    }

    /// Registers a query-event inbox and subscribes it, keeping the
    /// subscribe ordered before the query event publish. Returns false
    /// when the service is not serving.
    pub(crate) fn arm_query_event(&self, subject: &str, state: Arc<QueryEventState>) -> bool {
        let rt = self.inner.runtime.lock().unwrap();
        let Some(rt) = rt.as_ref() else {
            return false;
        };
        let Some(in_tx) = rt.in_tx.clone() else {
            return false;
        };
        self.inner
            .queries
            .lock()
            .unwrap()
            .insert(subject.to_string(), state);
        let _ = rt.out_tx.send(BrokerOp::Subscribe {
            subject: subject.to_string(),
            tx: in_tx,
        });
        true
    }

    /// Starts the query-event window timer. On expiry the inbox is
    /// unsubscribed and the callback receives its end-of-window `None` on
    /// the group's worker; cancellation at shutdown skips the callback.
    pub(crate) fn spawn_query_timer(&self, subject: String) {
        let (cancel, duration, handle, out_tx, work) = {
            let rt = self.inner.runtime.lock().unwrap();
            let Some(rt) = rt.as_ref() else {
                return;
            };
            (
                rt.cancel.clone(),
                rt.query_event_duration,
                rt.handle.clone(),
                rt.out_tx.clone(),
                rt.work.clone(),
            )
        };
        let service = self.clone();
        let _ = work.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        service.inner.queries.lock().unwrap().remove(&subject);
                    }
                    _ = tokio::time::sleep(duration) => {
                        let _ = out_tx.send(BrokerOp::Unsubscribe {
                            subject: subject.clone(),
                        });
                        let state = service.inner.queries.lock().unwrap().remove(&subject);
                        if let Some(state) = state {
                            let group = state.resource.group().to_string();
                            service.enqueue(
                                group,
                                Box::new(move || crate::query::end_query_window(state)),
                            );
                        }
                    }
                }
            },
            &handle,
        );
    }

    pub(crate) fn error_event(&self, message: &str) {
        let cb = self.inner.opts.lock().unwrap().on_error.clone();
        if let Some(cb) = cb {
            cb(self, message);
        }
    }
}

async fn broker_loop(conn: Arc<dyn Conn>, mut rx: mpsc::UnboundedReceiver<BrokerOp>) {
    let mut subs: HashMap<String, Box<dyn Subscription>> = HashMap::new();
    while let Some(op) = rx.recv().await {
        match op {
            BrokerOp::Publish { subject, payload } => {
                if let Err(e) = conn.publish(&subject, &payload).await {
                    error!(%subject, "publish failed: {e}");
                }
            }
            BrokerOp::Subscribe { subject, tx } => match conn.chan_subscribe(&subject, tx).await {
                Ok(sub) => {
                    subs.insert(subject, sub);
                }
                Err(e) => error!(%subject, "subscribe failed: {e}"),
            },
            BrokerOp::Unsubscribe { subject } => {
                if let Some(sub) = subs.remove(&subject) {
                    let _ = sub.unsubscribe().await;
                }
            }
        }
    }
}

/// Rewrites a pattern into broker-subject form: placeholders become `*`.
fn to_subject(pattern: &str) -> String {
    if pattern.is_empty() {
        return String::new();
    }
    pattern
        .split('.')
        .map(|part| if part.starts_with('$') { "*" } else { part })
        .collect::<Vec<_>>()
        .join(".")
}

/// Computes the broker subscription subjects for the owned resource and
/// access patterns, suppressing subjects strictly dominated by another.
fn subscription_subjects(resources: &[String], access: &[String]) -> Vec<String> {
    let mut subjects = Vec::new();
    for s in resources {
        subjects.push(format!("get.{s}"));
        // Call and auth subjects carry a trailing method token.
        let with_method = if s == ">" || s.ends_with(".>") {
            s.clone()
        } else {
            format!("{s}.*")
        };
        subjects.push(format!("call.{with_method}"));
        subjects.push(format!("auth.{with_method}"));
    }
    for s in access {
        subjects.push(format!("access.{s}"));
    }
    subjects.sort();
    subjects.dedup();
    let keep: Vec<String> = subjects
        .iter()
        .filter(|s| !subjects.iter().any(|o| o != *s && dominates(o, s)))
        .cloned()
        .collect();
    keep
}

// Reports whether subject pattern `a` matches every subject `b` matches.
fn dominates(a: &str, b: &str) -> bool {
    fn rec(a: &[&str], b: &[&str]) -> bool {
        match (a.first(), b.first()) {
            (None, None) => true,
            (Some(&">"), Some(_)) => true,
            (Some(&"*"), Some(&">")) => false,
            (Some(&"*"), Some(_)) => rec(&a[1..], &b[1..]),
            (Some(&x), Some(&y)) => x == y && rec(&a[1..], &b[1..]),
            _ => false,
        }
    }
    let at: Vec<&str> = a.split('.').collect();
    let bt: Vec<&str> = b.split('.').collect();
    rec(&at, &bt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_subject_rewrites_placeholders() {
        assert_eq!(to_subject("lib.$id.book"), "lib.*.book");
        assert_eq!(to_subject("lib.>"), "lib.>");
        assert_eq!(to_subject("lib.*"), "lib.*");
        assert_eq!(to_subject(""), "");
    }

    #[test]
    fn domination_ordering() {
        assert!(dominates("lib.>", "lib.book.42"));
        assert!(dominates("lib.>", "lib.book.*"));
        assert!(dominates("lib.>", "lib.*.>"));
        assert!(dominates("lib.*", "lib.book"));
        assert!(!dominates("lib.*", "lib.>"));
        assert!(!dominates("lib.book", "lib.*"));
        assert!(!dominates("lib.*", "lib.book.42"));
        assert!(dominates(">", "anything.at.all"));
    }

    #[test]
    fn subscription_subjects_for_plain_patterns() {
        let subjects = subscription_subjects(
            &["lib.book.*".to_string()],
            &["lib.book.*".to_string()],
        );
        assert_eq!(
            subjects,
            vec![
                "access.lib.book.*",
                "auth.lib.book.*.*",
                "call.lib.book.*.*",
                "get.lib.book.*",
            ]
        );
    }

    #[test]
    fn subscription_subjects_suppress_dominated() {
        let subjects = subscription_subjects(
            &["lib.>".to_string(), "lib.book.*".to_string()],
            &[],
        );
        assert_eq!(subjects, vec!["auth.lib.>", "call.lib.>", "get.lib.>"]);
    }

    #[test]
    fn full_wildcard_pattern_skips_method_token() {
        let subjects = subscription_subjects(&["lib.>".to_string()], &[]);
        assert!(subjects.contains(&"call.lib.>".to_string()));
        assert!(subjects.contains(&"auth.lib.>".to_string()));
    }

    #[test]
    #[should_panic(expected = "invalid service name")]
    fn invalid_service_name_panics() {
        let _ = Service::new("bad name");
    }

    #[test]
    fn empty_service_name_owns_namespace() {
        let service = Service::new("");
        service.handle("model", Handler::new().get(|_r| Ok(())));
        assert!(service.resolve("model").is_some());
    }

    #[test]
    #[should_panic(expected = "invalid connection ID")]
    fn token_event_rejects_multi_token_cid() {
        let service = Service::new("test");
        service.token_event("a.b", serde_json::json!(null));
    }

    #[test]
    fn with_requires_matching_handler() {
        let service = Service::new("test");
        service.handle("model", Handler::new().get(|_r| Ok(())));
        let err = service.with("test.other", |_r| {}).unwrap_err();
        assert!(matches!(err, ServiceError::NoMatchingHandler(_)));
        // A matching handler on a stopped service fails with NotStarted.
        let err = service.with("test.model", |_r| {}).unwrap_err();
        assert!(matches!(err, ServiceError::NotStarted));
    }

    #[test]
    fn protocol_version_reported() {
        assert_eq!(Service::new("t").protocol_version(), "1.2.0");
    }
}
