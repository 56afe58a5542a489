use std::collections::HashMap;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::codec::{self, QueryEventEntry, QueryRequestDto};
use crate::error::{codes, Error};
use crate::handler::ResourceType;
use crate::resource::Resource;

pub(crate) type QueryCallback = Arc<dyn Fn(Option<&mut QueryRequest>) + Send + Sync>;

/// An armed query event: the inbox subject is subscribed and `cb` handles
/// query requests until the window expires.
pub(crate) struct QueryEventState {
    pub(crate) resource: Resource,
    pub(crate) cb: QueryCallback,
}

/// Publishes a query event for the resource and arms its inbox window.
pub(crate) fn start_query_event(resource: Resource, cb: QueryCallback) {
    let service = resource.service().clone();
    let subject = format!("_QUERY_.{}", uuid::Uuid::new_v4().simple());
    let state = Arc::new(QueryEventState {
        resource: resource.clone(),
        cb,
    });
    if !service.arm_query_event(&subject, state.clone()) {
        // Not serving; still honor the exactly-once end-of-window contract.
        tracing::error!(
            rname = %resource.resource_name(),
            "query event while service is not serving"
        );
        end_query_window(state);
        return;
    }
    resource.publish_event(
        "query",
        serde_json::to_vec(&codec::QueryEventPayload { subject: &subject }).ok(),
    );
    service.spawn_query_timer(subject);
}

/// Handles one inbound query request on an armed inbox. Runs on the
/// resource's group worker.
pub(crate) fn process_query_request(
    state: Arc<QueryEventState>,
    reply_to: String,
    payload: Vec<u8>,
) {
    let service = state.resource.service().clone();
    let dto: QueryRequestDto = match serde_json::from_slice(&payload) {
        Ok(dto) => dto,
        Err(e) => {
            tracing::error!("malformed query request: {e}");
            let err = Error::new(codes::INVALID_QUERY, format!("Invalid query: {e}"));
            service.publish_out(&reply_to, codec::error_reply(&err, None));
            return;
        }
    };
    let query = dto.query.unwrap_or_default();
    if query.is_empty() {
        let err = Error::invalid_query();
        service.publish_out(&reply_to, codec::error_reply(&err, None));
        return;
    }

    let mut resource = state.resource.clone();
    resource.query = query;
    let mut req = QueryRequest {
        resource,
        reply_to,
        replied: false,
        events: Vec::new(),
    };
    let result = catch_unwind(AssertUnwindSafe(|| (state.cb)(Some(&mut req))));
    match result {
        Ok(()) => {
            if !req.replied {
                req.reply_events();
            }
        }
        Err(p) => {
            if let Some(err) = p.downcast_ref::<Error>() {
                req.send_error_unchecked(err);
            } else {
                tracing::error!(
                    rname = %req.resource.resource_name(),
                    "query callback panicked: {}",
                    crate::dispatch::panic_message(&p)
                );
                req.send_error_unchecked(&Error::internal_error());
            }
        }
    }
}

/// Ends a query-event window: the exactly-once `None` callback.
pub(crate) fn end_query_window(state: Arc<QueryEventState>) {
    if let Err(p) = catch_unwind(AssertUnwindSafe(|| (state.cb)(None))) {
        tracing::error!(
            rname = %state.resource.resource_name(),
            "query callback panicked at end of window: {}",
            crate::dispatch::panic_message(&p)
        );
    }
}

/// A query request received during a query-event window.
///
/// The callback replies either with a full model or collection, or by
/// recording the ordered mutation events
/// ([`change_event`](QueryRequest::change_event),
/// [`add_event`](QueryRequest::add_event),
/// [`remove_event`](QueryRequest::remove_event)) that bring the caller's
/// cache of the queried resource up to date. Recorded events are sent as
/// the reply when the callback returns without an explicit one.
pub struct QueryRequest {
    pub(crate) resource: Resource,
    pub(crate) reply_to: String,
    pub(crate) replied: bool,
    pub(crate) events: Vec<QueryEventEntry>,
}

impl Deref for QueryRequest {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl QueryRequest {
    /// Records a change event for the queried resource. No apply hooks are
    /// invoked; the event describes the caller's cache, not service state.
    pub fn change_event(&mut self, changes: HashMap<String, Value>) -> Result<(), Error> {
        self.check_open();
        if self.resource_declared_type() == ResourceType::Collection {
            panic!("change event on collection resource {}", self.resource.resource_name());
        }
        if changes.is_empty() {
            return Ok(());
        }
        let data = serde_json::to_value(codec::ChangeEventPayload { values: &changes })
            .map_err(|e| Error::new(codes::INTERNAL_ERROR, format!("Internal error: {e}")))?;
        self.events.push(QueryEventEntry {
            event: "change".to_string(),
            data,
        });
        Ok(())
    }

    /// Records an add event for the queried resource.
    pub fn add_event(&mut self, value: Value, idx: usize) -> Result<(), Error> {
        self.check_open();
        if self.resource_declared_type() == ResourceType::Model {
            panic!("add event on model resource {}", self.resource.resource_name());
        }
        let data = serde_json::to_value(codec::AddEventPayload { value: &value, idx })
            .map_err(|e| Error::new(codes::INTERNAL_ERROR, format!("Internal error: {e}")))?;
        self.events.push(QueryEventEntry {
            event: "add".to_string(),
            data,
        });
        Ok(())
    }

    /// Records a remove event for the queried resource.
    pub fn remove_event(&mut self, idx: usize) -> Result<(), Error> {
        self.check_open();
        if self.resource_declared_type() == ResourceType::Model {
            panic!("remove event on model resource {}", self.resource.resource_name());
        }
        let data = serde_json::to_value(codec::RemoveEventPayload { idx })
            .map_err(|e| Error::new(codes::INTERNAL_ERROR, format!("Internal error: {e}")))?;
        self.events.push(QueryEventEntry {
            event: "remove".to_string(),
            data,
        });
        Ok(())
    }

    /// Replies with the full model limited by the query.
    pub fn model<T: Serialize>(&mut self, model: T) {
        if self.resource_declared_type() == ResourceType::Collection {
            panic!("model reply on collection resource {}", self.resource.resource_name());
        }
        self.reply_result(codec::ModelResult { model, query: None });
    }

    /// Replies with the full collection limited by the query.
    pub fn collection<T: Serialize>(&mut self, collection: T) {
        if self.resource_declared_type() == ResourceType::Model {
            panic!("collection reply on model resource {}", self.resource.resource_name());
        }
        self.reply_result(codec::CollectionResult {
            collection,
            query: None,
        });
    }

    /// Replies with `system.notFound`.
    pub fn not_found(&mut self) {
        self.reply_error(&Error::not_found());
    }

    /// Replies with `system.invalidQuery`, optionally overriding the
    /// canonical message.
    pub fn invalid_query(&mut self, message: &str) {
        let err = if message.is_empty() {
            Error::invalid_query()
        } else {
            Error::new(codes::INVALID_QUERY, message)
        };
        self.reply_error(&err);
    }

    /// Replies with a protocol error.
    pub fn error(&mut self, err: &Error) {
        self.reply_error(err);
    }

    /// Asks the gateway to extend its wait for this query request.
    pub fn timeout(&self, duration: Duration) {
        if self.replied {
            panic!("timeout requested after reply");
        }
        self.resource
            .service()
            .publish_out(&self.reply_to, codec::timeout_directive(duration.as_millis()));
    }

    fn resource_declared_type(&self) -> ResourceType {
        self.resource
            .handler
            .as_ref()
            .map(|h| h.handler.typ)
            .unwrap_or_default()
    }

    fn check_open(&self) {
        if self.replied {
            panic!("query event recorded after reply");
        }
    }

    fn reply_result<T: Serialize>(&mut self, result: T) {
        let payload = match codec::result_reply(result, None) {
            Ok(p) => p,
            Err(e) => std::panic::panic_any(Error::new(
                codes::INTERNAL_ERROR,
                format!("Internal error: failed to serialize result: {e}"),
            )),
        };
        self.reply_raw(payload);
    }

    fn reply_error(&mut self, err: &Error) {
        let payload = codec::error_reply(err, None);
        self.reply_raw(payload);
    }

    fn reply_raw(&mut self, payload: Vec<u8>) {
        if self.replied {
            panic!(
                "response already sent on query request for {}",
                self.resource.resource_name()
            );
        }
        self.replied = true;
        self.resource.service().publish_out(&self.reply_to, payload);
    }

    fn send_error_unchecked(&mut self, err: &Error) {
        if !self.replied {
            self.replied = true;
            self.resource
                .service()
                .publish_out(&self.reply_to, codec::error_reply(err, None));
        }
    }

    pub(crate) fn reply_events(&mut self) {
        let payload = match codec::result_reply(
            codec::QueryEventsResult {
                events: &self.events,
            },
            None,
        ) {
            Ok(p) => p,
            Err(_) => codec::error_reply(&Error::internal_error(), None),
        };
        self.reply_raw(payload);
    }
}

/// The default query-event window.
pub(crate) const DEFAULT_QUERY_EVENT_DURATION: Duration = Duration::from_secs(3);
