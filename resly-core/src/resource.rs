use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::codec;
use crate::error::Error;
use crate::event::{validate_event_name, ResourceEvent};
use crate::handler::{ListenerFn, ResourceType};
use crate::mux::RegisteredHandler;
use crate::query::QueryRequest;
use crate::service::Service;

/// A matched resource: the context events are emitted from.
///
/// Handlers receive a `Resource` through their request objects (requests
/// deref to it); [`Service::with`] hands one to out-of-band closures. All
/// methods are safe to call only from the owning group's worker, which is
/// the only place the framework ever hands one out.
#[derive(Clone)]
pub struct Resource {
    pub(crate) service: Service,
    pub(crate) rname: String,
    pub(crate) params: Arc<HashMap<String, String>>,
    pub(crate) query: String,
    pub(crate) group: String,
    pub(crate) handler: Option<Arc<RegisteredHandler>>,
    pub(crate) listeners: Arc<Vec<ListenerFn>>,
}

impl Resource {
    /// The service the resource belongs to.
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// The resource name, without query.
    pub fn resource_name(&self) -> &str {
        &self.rname
    }

    /// The resource ID: resource name plus query when one is set.
    pub fn rid(&self) -> String {
        if self.query.is_empty() {
            self.rname.clone()
        } else {
            format!("{}?{}", self.rname, self.query)
        }
    }

    /// The query part of the resource ID, or the empty string.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Path parameters bound by the pattern's placeholders.
    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// A single path parameter, or the empty string when the pattern does
    /// not bind it.
    pub fn path_param(&self, name: &str) -> &str {
        self.params.get(name).map(String::as_str).unwrap_or("")
    }

    pub(crate) fn group(&self) -> &str {
        &self.group
    }

    fn resource_type(&self) -> ResourceType {
        self.handler
            .as_ref()
            .map(|h| h.handler.typ)
            .unwrap_or_default()
    }

    /// Emits a custom event on the resource.
    ///
    /// # Panics
    ///
    /// Panics if `name` is reserved or not a single printable token.
    pub fn event(&self, name: &str, payload: impl Serialize) {
        if let Err(e) = validate_event_name(name) {
            panic!("{e}");
        }
        let value = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => std::panic::panic_any(Error::new(
                crate::error::codes::INTERNAL_ERROR,
                format!("Internal error: failed to serialize event payload: {e}"),
            )),
        };
        self.publish_event(name, serde_json::to_vec(&value).ok());
        let mut ev = ResourceEvent::new(self.clone(), name);
        ev.payload = Some(value);
        self.fire_listeners(&ev);
    }

    /// Emits a change event carrying the changed key-values. Deleted keys
    /// are encoded with [`delete_action`](crate::types::delete_action). An
    /// empty change map is a no-op.
    ///
    /// When an `apply_change` hook is set it runs first; its error aborts
    /// the event, and its reverse map is passed on to listeners.
    ///
    /// # Panics
    ///
    /// Panics if the resource is typed as a collection.
    pub fn change_event(&self, changes: HashMap<String, Value>) -> Result<(), Error> {
        if self.resource_type() == ResourceType::Collection {
            panic!("change event on collection resource {}", self.rname);
        }
        if changes.is_empty() {
            return Ok(());
        }
        let reverse = match self.handler.as_ref().and_then(|h| h.handler.apply_change.as_ref()) {
            Some(hook) => Some(hook(self, &changes)?),
            None => None,
        };
        self.publish_event(
            "change",
            serde_json::to_vec(&codec::ChangeEventPayload { values: &changes }).ok(),
        );
        let mut ev = ResourceEvent::new(self.clone(), "change");
        ev.new_values = Some(changes);
        ev.old_values = reverse;
        self.fire_listeners(&ev);
        Ok(())
    }

    /// Emits an add event inserting `value` at `idx`.
    ///
    /// # Panics
    ///
    /// Panics if the resource is typed as a model.
    pub fn add_event(&self, value: Value, idx: usize) -> Result<(), Error> {
        if self.resource_type() == ResourceType::Model {
            panic!("add event on model resource {}", self.rname);
        }
        if let Some(hook) = self.handler.as_ref().and_then(|h| h.handler.apply_add.as_ref()) {
            hook(self, &value, idx)?;
        }
        self.publish_event(
            "add",
            serde_json::to_vec(&codec::AddEventPayload { value: &value, idx }).ok(),
        );
        let mut ev = ResourceEvent::new(self.clone(), "add");
        ev.value = Some(value);
        ev.idx = Some(idx);
        self.fire_listeners(&ev);
        Ok(())
    }

    /// Emits a remove event for the value at `idx`. When an `apply_remove`
    /// hook is set, the value it reports as removed is passed on to
    /// listeners.
    ///
    /// # Panics
    ///
    /// Panics if the resource is typed as a model.
    pub fn remove_event(&self, idx: usize) -> Result<(), Error> {
        if self.resource_type() == ResourceType::Model {
            panic!("remove event on model resource {}", self.rname);
        }
        let removed = match self.handler.as_ref().and_then(|h| h.handler.apply_remove.as_ref()) {
            Some(hook) => Some(hook(self, idx)?),
            None => None,
        };
        self.publish_event(
            "remove",
            serde_json::to_vec(&codec::RemoveEventPayload { idx }).ok(),
        );
        let mut ev = ResourceEvent::new(self.clone(), "remove");
        ev.idx = Some(idx);
        ev.value = removed;
        self.fire_listeners(&ev);
        Ok(())
    }

    /// Emits a create event signalling the resource now exists. `data` is
    /// handed to the `apply_create` hook and to listeners; the event itself
    /// carries no payload.
    pub fn create_event(&self, data: Value) -> Result<(), Error> {
        if let Some(hook) = self.handler.as_ref().and_then(|h| h.handler.apply_create.as_ref()) {
            hook(self, &data)?;
        }
        self.publish_event("create", None);
        let mut ev = ResourceEvent::new(self.clone(), "create");
        ev.data = Some(data);
        self.fire_listeners(&ev);
        Ok(())
    }

    /// Emits a delete event signalling the resource no longer exists. When
    /// an `apply_delete` hook is set, the prior data it reports is passed
    /// on to listeners.
    pub fn delete_event(&self) -> Result<(), Error> {
        let prior = match self.handler.as_ref().and_then(|h| h.handler.apply_delete.as_ref()) {
            Some(hook) => Some(hook(self)?),
            None => None,
        };
        self.publish_event("delete", None);
        let mut ev = ResourceEvent::new(self.clone(), "delete");
        ev.data = prior;
        self.fire_listeners(&ev);
        Ok(())
    }

    /// Emits a reaccess event, telling the gateway to re-run access
    /// requests for the resource's subscribers.
    pub fn reaccess_event(&self) {
        self.publish_event("reaccess", None);
    }

    /// Publishes a query event and collects query requests for the duration
    /// of the query-event window.
    ///
    /// `cb` runs on this resource's group worker once per incoming query
    /// request with `Some(request)`, and exactly once with `None` when the
    /// window expires.
    pub fn query_event<F>(&self, cb: F)
    where
        F: Fn(Option<&mut QueryRequest>) + Send + Sync + 'static,
    {
        crate::query::start_query_event(self.clone(), Arc::new(cb));
    }

    pub(crate) fn publish_event(&self, name: &str, payload: Option<Vec<u8>>) {
        let subject = format!("event.{}.{name}", self.rname);
        self.service
            .publish_out(&subject, payload.unwrap_or_default());
    }

    pub(crate) fn fire_listeners(&self, ev: &ResourceEvent) {
        for listener in self.listeners.iter() {
            listener(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::mux::RegisteredHandler;

    fn resource_with(handler: Handler) -> Resource {
        let service = Service::new("test");
        Resource {
            service,
            rname: "test.model".to_string(),
            params: Arc::new(HashMap::new()),
            query: String::new(),
            group: "test.model".to_string(),
            handler: Some(Arc::new(RegisteredHandler {
                handler,
                group: None,
            })),
            listeners: Arc::new(Vec::new()),
        }
    }

    #[test]
    fn rid_includes_query() {
        let mut r = resource_with(Handler::new());
        assert_eq!(r.rid(), "test.model");
        r.query = "limit=5".to_string();
        assert_eq!(r.rid(), "test.model?limit=5");
    }

    #[test]
    fn empty_change_is_noop_before_hook() {
        let r = resource_with(Handler::new().model().apply_change(|_r, _c| {
            panic!("hook must not run for empty change");
        }));
        r.change_event(HashMap::new()).unwrap();
    }

    #[test]
    #[should_panic(expected = "change event on collection resource")]
    fn change_on_collection_panics() {
        let r = resource_with(Handler::new().collection());
        let mut changes = HashMap::new();
        changes.insert("k".to_string(), Value::from(1));
        let _ = r.change_event(changes);
    }

    #[test]
    #[should_panic(expected = "add event on model resource")]
    fn add_on_model_panics() {
        let r = resource_with(Handler::new().model());
        let _ = r.add_event(Value::from(1), 0);
    }

    #[test]
    fn apply_change_error_aborts_event() {
        let r = resource_with(
            Handler::new()
                .model()
                .apply_change(|_r, _c| Err(Error::new("test.fail", "Hook failed"))),
        );
        let mut changes = HashMap::new();
        changes.insert("k".to_string(), Value::from(1));
        let err = r.change_event(changes).unwrap_err();
        assert_eq!(err.code, "test.fail");
    }

    #[test]
    #[should_panic(expected = "reserved event name")]
    fn reserved_custom_event_panics() {
        let r = resource_with(Handler::new());
        r.event("change", Value::Null);
    }
}
