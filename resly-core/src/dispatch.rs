use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{error, trace};

use crate::codec::{self, RequestDto};
use crate::conn::RawMessage;
use crate::error::{codes, Error};
use crate::handler::GetKind;
use crate::mux::Match;
use crate::request::{
    AccessRequest, AuthRequest, CallRequest, CollectionRequest, GetRequest, ModelRequest,
    NewRequest, RequestCtx,
};
use crate::resource::Resource;
use crate::service::Service;

pub(crate) type Thunk = Box<dyn FnOnce() + Send>;

/// Per-group FIFO work queues drained by a bounded pool.
///
/// The first thunk enqueued for an idle group spawns a drain task for that
/// group; the task takes a pool permit, then pops and runs thunks in order,
/// removing the map entry exactly when the queue empties. The critical
/// section covers only queue mutation, never thunk execution.
pub(crate) struct WorkQueues {
    queues: Mutex<HashMap<String, VecDeque<Thunk>>>,
    pool: Arc<Semaphore>,
    pub(crate) tracker: TaskTracker,
    handle: tokio::runtime::Handle,
}

impl WorkQueues {
    pub(crate) fn new(workers: usize, handle: tokio::runtime::Handle) -> Arc<Self> {
        Arc::new(WorkQueues {
            queues: Mutex::new(HashMap::new()),
            pool: Arc::new(Semaphore::new(workers)),
            tracker: TaskTracker::new(),
            handle,
        })
    }

    /// Appends a thunk to the group's queue, activating a drain task when
    /// the group was idle.
    pub(crate) fn enqueue(self: &Arc<Self>, group: String, thunk: Thunk) {
        let activate = {
            let mut queues = self.queues.lock().unwrap();
            match queues.get_mut(&group) {
                Some(queue) => {
                    queue.push_back(thunk);
                    false
                }
                None => {
                    queues.insert(group.clone(), VecDeque::from([thunk]));
                    true
                }
            }
        };
        if activate {
            let wq = self.clone();
            let handle = self.handle.clone();
            let _ = self.tracker.spawn_on(
                async move {
                    let _permit = wq
                        .pool
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("worker pool semaphore closed");
                    let drain = wq.clone();
                    // Handlers are synchronous and may block; keep them off
                    // the async worker threads.
                    let _ = handle
                        .spawn_blocking(move || drain.drain_group(group))
                        .await;
                },
                &self.handle,
            );
        }
    }

    fn drain_group(&self, group: String) {
        loop {
            let thunk = {
                let mut queues = self.queues.lock().unwrap();
                let queue = queues.get_mut(&group).expect("active group queue missing");
                match queue.pop_front() {
                    Some(thunk) => thunk,
                    None => {
                        queues.remove(&group);
                        return;
                    }
                }
            };
            // Request thunks recover on their own; this guards the queue
            // against panics from out-of-band closures.
            if let Err(p) = catch_unwind(AssertUnwindSafe(thunk)) {
                error!(%group, "worker closure panicked: {}", panic_message(&p));
            }
        }
    }
}

/// Classifies and routes one inbound broker message. Runs on the listener
/// task.
pub(crate) fn dispatch(service: &Service, msg: RawMessage) {
    // Query-event inboxes are matched before the request subject scheme.
    if let Some(state) = service.lookup_query(&msg.subject) {
        let Some(reply) = msg.reply else {
            error!(subject = %msg.subject, "query request without reply subject");
            return;
        };
        let group = state.resource.group().to_string();
        service.enqueue(
            group,
            Box::new(move || crate::query::process_query_request(state, reply, msg.payload)),
        );
        return;
    }

    let Some((rtype, rest)) = msg.subject.split_once('.') else {
        error!(subject = %msg.subject, "malformed request subject");
        return;
    };
    let rtype = match rtype {
        "access" => RequestType::Access,
        "get" => RequestType::Get,
        "call" => RequestType::Call,
        "auth" => RequestType::Auth,
        _ => {
            error!(subject = %msg.subject, "unknown request type");
            return;
        }
    };
    let Some(reply) = msg.reply else {
        error!(subject = %msg.subject, "request without reply subject");
        service.error_event(&format!("request without reply subject: {}", msg.subject));
        return;
    };

    let (rname, method) = match rtype {
        RequestType::Call | RequestType::Auth => match rest.rsplit_once('.') {
            Some((rname, method)) => (rname, method),
            None => (rest, ""),
        },
        _ => (rest, ""),
    };

    trace!(subject = %msg.subject, "dispatching request");
    let m = service.resolve(rname);
    let group = m
        .as_ref()
        .map(|m| m.group.clone())
        .unwrap_or_else(|| rname.to_string());
    let rname = rname.to_string();
    let method = method.to_string();
    let svc = service.clone();
    service.enqueue(
        group,
        Box::new(move || process_request(svc, rtype, rname, method, m, reply, msg.payload)),
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestType {
    Access,
    Get,
    Call,
    Auth,
}

/// Processes one request on its group's worker: decodes the payload, runs
/// the matching callback inside the recovery shim, and guarantees exactly
/// one reply.
pub(crate) fn process_request(
    service: Service,
    rtype: RequestType,
    rname: String,
    method: String,
    m: Option<Match>,
    reply_to: String,
    payload: Vec<u8>,
) {
    let dto: RequestDto = if payload.is_empty() {
        RequestDto::default()
    } else {
        match serde_json::from_slice(&payload) {
            Ok(dto) => dto,
            Err(e) => {
                error!(%rname, "malformed request payload: {e}");
                let err = Error::new(
                    codes::INTERNAL_ERROR,
                    format!("Internal error: failed to decode request: {e}"),
                );
                service.publish_out(&reply_to, codec::error_reply(&err, None));
                return;
            }
        }
    };

    let (handler, params, group, listeners) = match m {
        Some(m) => (Some(m.handler), m.params, m.group, m.listeners),
        None => (None, HashMap::new(), rname.clone(), Vec::new()),
    };
    let resource = Resource {
        service: service.clone(),
        rname,
        params: Arc::new(params),
        query: dto.query.clone().unwrap_or_default(),
        group,
        handler: handler.clone(),
        listeners: Arc::new(listeners),
    };
    let mut ctx = RequestCtx::new(resource, reply_to, dto);

    let Some(handler) = handler else {
        ctx.send_error_unchecked(&Error::not_found());
        return;
    };
    let h = &handler.handler;

    match rtype {
        RequestType::Access => match h.access.clone() {
            Some(f) => run(AccessRequest { ctx }, AccessRequest::ctx_mut, |r| f(r)),
            None => ctx.send_error_unchecked(&Error::not_found()),
        },
        RequestType::Get => match h.get.clone() {
            Some(GetKind::Untyped(f)) => run(GetRequest { ctx }, GetRequest::ctx_mut, |r| f(r)),
            Some(GetKind::Model(f)) => run(
                ModelRequest {
                    inner: GetRequest { ctx },
                },
                ModelRequest::ctx_mut,
                |r| f(r),
            ),
            Some(GetKind::Collection(f)) => run(
                CollectionRequest {
                    inner: GetRequest { ctx },
                },
                CollectionRequest::ctx_mut,
                |r| f(r),
            ),
            None => ctx.send_error_unchecked(&Error::not_found()),
        },
        RequestType::Call => match h.calls.get(&method).cloned() {
            Some(f) => run(CallRequest { ctx, method }, CallRequest::ctx_mut, |r| f(r)),
            None => match (method.as_str(), h.new_fn.clone()) {
                ("new", Some(f)) => run(NewRequest { ctx }, NewRequest::ctx_mut, |r| f(r)),
                _ => ctx.send_error_unchecked(&Error::method_not_found()),
            },
        },
        RequestType::Auth => match h.auths.get(&method).cloned() {
            Some(f) => run(AuthRequest { ctx, method }, AuthRequest::ctx_mut, |r| f(r)),
            None => ctx.send_error_unchecked(&Error::method_not_found()),
        },
    }
}

// The recovery shim. Guarantees a reply: a protocol error returned or
// panicked by the handler is sent without logging, a foreign panic is
// logged and converted to an internal error, and a handler that neither
// replied nor failed produces the synthesized missing-response error.
fn run<R>(
    mut req: R,
    ctx_of: fn(&mut R) -> &mut RequestCtx,
    f: impl FnOnce(&mut R) -> Result<(), Error>,
) {
    let result = catch_unwind(AssertUnwindSafe(|| f(&mut req)));
    let ctx = ctx_of(&mut req);
    match result {
        Ok(Ok(())) => {
            ctx.send_error_unchecked(&Error::new(
                codes::INTERNAL_ERROR,
                "Internal error: missing response",
            ));
        }
        Ok(Err(err)) => {
            if ctx.replied {
                error!(
                    rname = %ctx.resource.resource_name(),
                    "handler returned error {err} after replying"
                );
            } else {
                ctx.send_error_unchecked(&err);
            }
        }
        Err(p) => match p.downcast::<Error>() {
            Ok(err) => ctx.send_error_unchecked(&err),
            Err(p) => {
                error!(
                    rname = %ctx.resource.resource_name(),
                    "handler panicked: {}",
                    panic_message(&p)
                );
                ctx.send_error_unchecked(&Error::internal_error());
            }
        },
    }
}

pub(crate) fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
