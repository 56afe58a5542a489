use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Error;
use crate::event::ResourceEvent;
use crate::request::{
    AccessRequest, AuthRequest, CallRequest, CollectionRequest, GetRequest, ModelRequest,
    NewRequest,
};
use crate::resource::Resource;
use crate::service::Service;

/// Declared type of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceType {
    #[default]
    Unset,
    Model,
    Collection,
}

pub(crate) type AccessFn = Arc<dyn Fn(&mut AccessRequest) -> Result<(), Error> + Send + Sync>;
pub(crate) type GetUntypedFn = Arc<dyn Fn(&mut GetRequest) -> Result<(), Error> + Send + Sync>;
pub(crate) type GetModelFn = Arc<dyn Fn(&mut ModelRequest) -> Result<(), Error> + Send + Sync>;
pub(crate) type GetCollectionFn =
    Arc<dyn Fn(&mut CollectionRequest) -> Result<(), Error> + Send + Sync>;
pub(crate) type CallFn = Arc<dyn Fn(&mut CallRequest) -> Result<(), Error> + Send + Sync>;
pub(crate) type AuthFn = Arc<dyn Fn(&mut AuthRequest) -> Result<(), Error> + Send + Sync>;
pub(crate) type NewFn = Arc<dyn Fn(&mut NewRequest) -> Result<(), Error> + Send + Sync>;
pub(crate) type OnRegisterFn = Arc<dyn Fn(&Service, &str) + Send + Sync>;
pub(crate) type ListenerFn = Arc<dyn Fn(&ResourceEvent) + Send + Sync>;

pub(crate) type ApplyChangeFn = Arc<
    dyn Fn(&Resource, &HashMap<String, Value>) -> Result<HashMap<String, Value>, Error>
        + Send
        + Sync,
>;
pub(crate) type ApplyAddFn =
    Arc<dyn Fn(&Resource, &Value, usize) -> Result<(), Error> + Send + Sync>;
pub(crate) type ApplyRemoveFn = Arc<dyn Fn(&Resource, usize) -> Result<Value, Error> + Send + Sync>;
pub(crate) type ApplyCreateFn = Arc<dyn Fn(&Resource, &Value) -> Result<(), Error> + Send + Sync>;
pub(crate) type ApplyDeleteFn = Arc<dyn Fn(&Resource) -> Result<Value, Error> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum GetKind {
    Untyped(GetUntypedFn),
    Model(GetModelFn),
    Collection(GetCollectionFn),
}

/// A resource handler: the set of callbacks registered for one pattern.
///
/// Built by value and sealed at registration:
///
/// ```ignore
/// service.handle(
///     "book.$id",
///     Handler::new()
///         .access(|r| { r.access_granted(); Ok(()) })
///         .get_model(move |r| { r.model(&book); Ok(()) })
///         .call("set", move |r| { /* ... */ Ok(()) }),
/// );
/// ```
#[derive(Clone, Default)]
pub struct Handler {
    pub(crate) typ: ResourceType,
    pub(crate) access: Option<AccessFn>,
    pub(crate) get: Option<GetKind>,
    pub(crate) calls: HashMap<String, CallFn>,
    pub(crate) auths: HashMap<String, AuthFn>,
    pub(crate) new_fn: Option<NewFn>,
    pub(crate) apply_change: Option<ApplyChangeFn>,
    pub(crate) apply_add: Option<ApplyAddFn>,
    pub(crate) apply_remove: Option<ApplyRemoveFn>,
    pub(crate) apply_create: Option<ApplyCreateFn>,
    pub(crate) apply_delete: Option<ApplyDeleteFn>,
    pub(crate) group: Option<String>,
    pub(crate) on_register: Option<OnRegisterFn>,
    pub(crate) listeners: Vec<(String, ListenerFn)>,
}

impl Handler {
    pub fn new() -> Self {
        Handler::default()
    }

    /// Declares the resource a model without setting a get callback.
    ///
    /// # Panics
    ///
    /// Panics if the resource type is already declared.
    pub fn model(mut self) -> Self {
        self.set_type(ResourceType::Model);
        self
    }

    /// Declares the resource a collection without setting a get callback.
    ///
    /// # Panics
    ///
    /// Panics if the resource type is already declared.
    pub fn collection(mut self) -> Self {
        self.set_type(ResourceType::Collection);
        self
    }

    /// Sets the access callback.
    ///
    /// # Panics
    ///
    /// Panics if an access callback is already set.
    pub fn access<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut AccessRequest) -> Result<(), Error> + Send + Sync + 'static,
    {
        if self.access.is_some() {
            panic!("access callback already set");
        }
        self.access = Some(Arc::new(f));
        self
    }

    /// Sets an untyped get callback that may reply with either a model or a
    /// collection.
    ///
    /// # Panics
    ///
    /// Panics if a get callback is already set.
    pub fn get<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut GetRequest) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.set_get(GetKind::Untyped(Arc::new(f)));
        self
    }

    /// Sets a model get callback and declares the resource a model.
    ///
    /// # Panics
    ///
    /// Panics if a get callback is already set or the resource type is
    /// already declared as something other than a model.
    pub fn get_model<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ModelRequest) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.set_type(ResourceType::Model);
        self.set_get(GetKind::Model(Arc::new(f)));
        self
    }

    /// Sets a collection get callback and declares the resource a
    /// collection.
    ///
    /// # Panics
    ///
    /// Panics if a get callback is already set or the resource type is
    /// already declared as something other than a collection.
    pub fn get_collection<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CollectionRequest) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.set_type(ResourceType::Collection);
        self.set_get(GetKind::Collection(Arc::new(f)));
        self
    }

    /// Registers a call method.
    ///
    /// # Panics
    ///
    /// Panics if the method name is invalid or already registered.
    pub fn call<F>(mut self, method: &str, f: F) -> Self
    where
        F: Fn(&mut CallRequest) -> Result<(), Error> + Send + Sync + 'static,
    {
        validate_method(method);
        if self.calls.insert(method.to_string(), Arc::new(f)).is_some() {
            panic!("call method {method:?} already registered");
        }
        self
    }

    /// Registers an auth method.
    ///
    /// # Panics
    ///
    /// Panics if the method name is invalid or already registered.
    pub fn auth<F>(mut self, method: &str, f: F) -> Self
    where
        F: Fn(&mut AuthRequest) -> Result<(), Error> + Send + Sync + 'static,
    {
        validate_method(method);
        if self.auths.insert(method.to_string(), Arc::new(f)).is_some() {
            panic!("auth method {method:?} already registered");
        }
        self
    }

    /// Registers the legacy `new` call handler, answering `call.<rid>.new`
    /// when no ordinary `new` call method is registered.
    #[deprecated(note = "register a call method replying with a resource reference instead")]
    pub fn new_resource<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut NewRequest) -> Result<(), Error> + Send + Sync + 'static,
    {
        if self.new_fn.is_some() {
            panic!("new handler already set");
        }
        self.new_fn = Some(Arc::new(f));
        self
    }

    /// Sets the hook invoked before a change event is published. Returns the
    /// reverse map of prior values for the keys being changed.
    pub fn apply_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &HashMap<String, Value>) -> Result<HashMap<String, Value>, Error>
            + Send
            + Sync
            + 'static,
    {
        self.apply_change = Some(Arc::new(f));
        self
    }

    /// Sets the hook invoked before an add event is published.
    pub fn apply_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &Value, usize) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.apply_add = Some(Arc::new(f));
        self
    }

    /// Sets the hook invoked before a remove event is published. Returns the
    /// removed value.
    pub fn apply_remove<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, usize) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.apply_remove = Some(Arc::new(f));
        self
    }

    /// Sets the hook invoked before a create event is published.
    pub fn apply_create<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &Value) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.apply_create = Some(Arc::new(f));
        self
    }

    /// Sets the hook invoked before a delete event is published. Returns the
    /// resource data that was deleted.
    pub fn apply_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.apply_delete = Some(Arc::new(f));
        self
    }

    /// Sets the group expression partitioning this handler's resources into
    /// serialization groups. `${tag}` references placeholders of the
    /// pattern the handler is registered on; validity is checked at
    /// registration.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets a callback invoked when the handler is attached to a service.
    pub fn on_register<F>(mut self, f: F) -> Self
    where
        F: Fn(&Service, &str) + Send + Sync + 'static,
    {
        self.on_register = Some(Arc::new(f));
        self
    }

    /// Attaches an event listener for the resources matching `pattern`,
    /// invoked synchronously on the emitting group's worker.
    pub fn on_event<F>(mut self, pattern: &str, f: F) -> Self
    where
        F: Fn(&ResourceEvent) + Send + Sync + 'static,
    {
        self.listeners.push((pattern.to_string(), Arc::new(f)));
        self
    }

    /// Reports whether the handler owns any non-access capability.
    pub(crate) fn has_resource_capability(&self) -> bool {
        self.get.is_some()
            || !self.calls.is_empty()
            || !self.auths.is_empty()
            || self.new_fn.is_some()
            || self.typ != ResourceType::Unset
    }

    fn set_type(&mut self, typ: ResourceType) {
        if self.typ != ResourceType::Unset && self.typ != typ {
            panic!("resource type already declared as {:?}", self.typ);
        }
        self.typ = typ;
    }

    fn set_get(&mut self, kind: GetKind) {
        if self.get.is_some() {
            panic!("get callback already set");
        }
        self.get = Some(kind);
    }
}

fn validate_method(method: &str) {
    let valid = !method.is_empty()
        && method
            .bytes()
            .all(|b| (0x21..=0x7e).contains(&b) && !matches!(b, b'.' | b'?' | b'*' | b'>'));
    if !valid {
        panic!("invalid method name {method:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_callbacks() {
        let h = Handler::new()
            .access(|r| {
                r.access_granted();
                Ok(())
            })
            .get_model(|r| {
                r.model(serde_json::json!({"id": 1}));
                Ok(())
            })
            .call("set", |_r| Ok(()));
        assert_eq!(h.typ, ResourceType::Model);
        assert!(h.access.is_some());
        assert!(h.get.is_some());
        assert!(h.calls.contains_key("set"));
        assert!(h.has_resource_capability());
    }

    #[test]
    fn access_only_handler_has_no_resource_capability() {
        let h = Handler::new().access(|r| {
            r.access_denied();
            Ok(())
        });
        assert!(!h.has_resource_capability());
    }

    #[test]
    #[should_panic(expected = "get callback already set")]
    fn duplicate_get_panics() {
        let _ = Handler::new()
            .get(|_r| Ok(()))
            .get_model(|_r| Ok(()));
    }

    #[test]
    #[should_panic(expected = "resource type already declared")]
    fn conflicting_type_panics() {
        let _ = Handler::new().model().collection();
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_call_method_panics() {
        let _ = Handler::new().call("set", |_r| Ok(())).call("set", |_r| Ok(()));
    }

    #[test]
    #[should_panic(expected = "invalid method name")]
    fn invalid_method_name_panics() {
        let _ = Handler::new().call("se.t", |_r| Ok(()));
    }
}
