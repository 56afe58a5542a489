use std::collections::HashMap;
use std::ops::Deref;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{self, Meta, RequestDto};
use crate::error::{codes, Error};
use crate::handler::ResourceType;
use crate::pattern::is_valid_rid;
use crate::resource::Resource;
use crate::types::Ref;

/// Shared request state: the resource, the reply subject, and the
/// at-most-one-reply bookkeeping.
pub(crate) struct RequestCtx {
    pub(crate) resource: Resource,
    pub(crate) reply_to: String,
    pub(crate) replied: bool,
    pub(crate) dto: RequestDto,
    pub(crate) meta: Meta,
}

impl RequestCtx {
    pub(crate) fn new(resource: Resource, reply_to: String, dto: RequestDto) -> Self {
        RequestCtx {
            resource,
            reply_to,
            replied: false,
            dto,
            meta: Meta::default(),
        }
    }

    fn meta_opt(&self) -> Option<&Meta> {
        if self.meta.is_empty() {
            None
        } else {
            Some(&self.meta)
        }
    }

    fn reply_raw(&mut self, payload: Vec<u8>) {
        if self.replied {
            panic!(
                "response already sent on request for {}",
                self.resource.resource_name()
            );
        }
        self.replied = true;
        self.resource
            .service()
            .publish_out(&self.reply_to, payload);
    }

    fn reply_result<T: Serialize>(&mut self, result: T) {
        let payload = match codec::result_reply(result, self.meta_opt()) {
            Ok(p) => p,
            Err(e) => std::panic::panic_any(Error::new(
                codes::INTERNAL_ERROR,
                format!("Internal error: failed to serialize result: {e}"),
            )),
        };
        self.reply_raw(payload);
    }

    fn reply_error(&mut self, err: &Error) {
        let payload = codec::error_reply(err, self.meta_opt());
        self.reply_raw(payload);
    }

    // Reply used by the recovery shim once the handler is done; never
    // panics on the replied flag.
    pub(crate) fn send_error_unchecked(&mut self, err: &Error) {
        if !self.replied {
            self.replied = true;
            let payload = codec::error_reply(err, self.meta_opt());
            self.resource
                .service()
                .publish_out(&self.reply_to, payload);
        }
    }

    fn timeout(&self, duration: Duration) {
        if self.replied {
            panic!("timeout requested after reply");
        }
        self.resource
            .service()
            .publish_out(&self.reply_to, codec::timeout_directive(duration.as_millis()));
    }

    fn parse_params<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let raw = self.dto.params.as_ref().map(|r| r.get()).unwrap_or("null");
        serde_json::from_str(raw)
            .map_err(|e| Error::new(codes::INVALID_PARAMS, format!("Invalid parameters: {e}")))
    }

    fn parse_token<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let raw = self.dto.token.as_ref().map(|r| r.get()).unwrap_or("null");
        serde_json::from_str(raw)
            .map_err(|e| Error::new(codes::INTERNAL_ERROR, format!("Internal error: failed to parse token: {e}")))
    }

    fn set_response_status(&mut self, status: u16) {
        self.check_meta_allowed();
        self.meta.status = Some(status);
    }

    fn add_response_header(&mut self, key: &str, value: &str) {
        self.check_meta_allowed();
        self.meta
            .header
            .get_or_insert_with(HashMap::new)
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }

    fn check_meta_allowed(&self) {
        if !self.dto.is_http() {
            panic!("response meta on a request without HTTP origin");
        }
        if self.replied {
            panic!("response meta set after reply");
        }
    }
}

macro_rules! base_request_impl {
    ($ty:ident) => {
        impl Deref for $ty {
            type Target = Resource;

            fn deref(&self) -> &Resource {
                &self.ctx.resource
            }
        }

        impl $ty {
            /// Replies with a protocol error.
            pub fn error(&mut self, err: &Error) {
                self.ctx.reply_error(err);
            }

            /// Replies with `system.notFound`.
            pub fn not_found(&mut self) {
                self.ctx.reply_error(&Error::not_found());
            }

            /// Asks the gateway to extend its wait for this request. Does
            /// not count as the reply.
            pub fn timeout(&self, duration: Duration) {
                self.ctx.timeout(duration);
            }

            pub(crate) fn ctx_mut(&mut self) -> &mut RequestCtx {
                &mut self.ctx
            }
        }
    };
}

macro_rules! http_origin_impl {
    ($ty:ident) => {
        impl $ty {
            /// The connection ID of the client the request originates from.
            pub fn cid(&self) -> Option<&str> {
                self.ctx.dto.cid.as_deref()
            }

            /// Parses the raw token into `T`. A missing token parses as
            /// JSON `null`. Failures map to an internal error suited for
            /// `?`-style short-circuiting.
            pub fn parse_token<T: DeserializeOwned>(&self) -> Result<T, Error> {
                self.ctx.parse_token()
            }

            /// Reports whether the request originated from an HTTP request
            /// to the gateway.
            pub fn is_http(&self) -> bool {
                self.ctx.dto.is_http()
            }

            /// HTTP headers of the originating request.
            pub fn header(&self) -> Option<&HashMap<String, Vec<String>>> {
                self.ctx.dto.header.as_ref()
            }

            /// Host of the originating HTTP request.
            pub fn host(&self) -> Option<&str> {
                self.ctx.dto.host.as_deref()
            }

            /// Network address of the originating client.
            pub fn remote_addr(&self) -> Option<&str> {
                self.ctx.dto.remote_addr.as_deref()
            }

            /// Unmodified request URI of the originating HTTP request.
            pub fn uri(&self) -> Option<&str> {
                self.ctx.dto.uri.as_deref()
            }

            /// Sets the HTTP response status. Valid only while the HTTP
            /// origin is active and before the reply.
            ///
            /// # Panics
            ///
            /// Panics when the request has no HTTP origin or is already
            /// replied to.
            pub fn set_response_status(&mut self, status: u16) {
                self.ctx.set_response_status(status);
            }

            /// Adds an HTTP response header. Same validity rules as
            /// [`set_response_status`](Self::set_response_status).
            pub fn add_response_header(&mut self, key: &str, value: &str) {
                self.ctx.add_response_header(key, value);
            }
        }
    };
}

/// An access request, answering whether a connection may get and call the
/// resource.
pub struct AccessRequest {
    pub(crate) ctx: RequestCtx,
}

base_request_impl!(AccessRequest);
http_origin_impl!(AccessRequest);

impl AccessRequest {
    /// Replies with the access grant: `get` allows subscriptions, `call`
    /// is a comma-separated list of callable methods, or `"*"` for all.
    /// An empty grant is normalized to an access-denied reply.
    pub fn access(&mut self, get: bool, call: &str) {
        if !get && call.is_empty() {
            self.access_denied();
        } else {
            self.ctx.reply_result(codec::AccessResult { get, call });
        }
    }

    /// Grants full access: get and all call methods.
    pub fn access_granted(&mut self) {
        self.access(true, "*");
    }

    /// Replies with `system.accessDenied`.
    pub fn access_denied(&mut self) {
        self.ctx.reply_error(&Error::access_denied());
    }
}

/// An untyped get request, free to reply with either a model or a
/// collection (subject to the handler's declared type).
pub struct GetRequest {
    pub(crate) ctx: RequestCtx,
}

base_request_impl!(GetRequest);

impl GetRequest {
    /// Replies with a model.
    ///
    /// # Panics
    ///
    /// Panics if the handler declares the resource a collection.
    pub fn model<T: Serialize>(&mut self, model: T) {
        self.check_type(ResourceType::Model);
        self.ctx.reply_result(codec::ModelResult { model, query: None });
    }

    /// Replies with a model limited by a normalized query.
    pub fn query_model<T: Serialize>(&mut self, model: T, query: &str) {
        self.check_type(ResourceType::Model);
        self.ctx.reply_result(codec::ModelResult {
            model,
            query: Some(query.to_string()),
        });
    }

    /// Replies with a collection.
    ///
    /// # Panics
    ///
    /// Panics if the handler declares the resource a model.
    pub fn collection<T: Serialize>(&mut self, collection: T) {
        self.check_type(ResourceType::Collection);
        self.ctx.reply_result(codec::CollectionResult {
            collection,
            query: None,
        });
    }

    /// Replies with a collection limited by a normalized query.
    pub fn query_collection<T: Serialize>(&mut self, collection: T, query: &str) {
        self.check_type(ResourceType::Collection);
        self.ctx.reply_result(codec::CollectionResult {
            collection,
            query: Some(query.to_string()),
        });
    }

    /// Replies with `system.invalidQuery`, optionally overriding the
    /// canonical message.
    pub fn invalid_query(&mut self, message: &str) {
        let err = if message.is_empty() {
            Error::invalid_query()
        } else {
            Error::new(codes::INVALID_QUERY, message)
        };
        self.ctx.reply_error(&err);
    }

    fn check_type(&self, replying: ResourceType) {
        let declared = self
            .ctx
            .resource
            .handler
            .as_ref()
            .map(|h| h.handler.typ)
            .unwrap_or_default();
        if declared != ResourceType::Unset && declared != replying {
            panic!(
                "{replying:?} reply on resource declared as {declared:?}",
            );
        }
    }
}

/// A get request for a model-typed resource.
pub struct ModelRequest {
    pub(crate) inner: GetRequest,
}

impl Deref for ModelRequest {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.inner.ctx.resource
    }
}

impl ModelRequest {
    pub fn model<T: Serialize>(&mut self, model: T) {
        self.inner.model(model);
    }

    pub fn query_model<T: Serialize>(&mut self, model: T, query: &str) {
        self.inner.query_model(model, query);
    }

    pub fn not_found(&mut self) {
        self.inner.not_found();
    }

    pub fn invalid_query(&mut self, message: &str) {
        self.inner.invalid_query(message);
    }

    pub fn error(&mut self, err: &Error) {
        self.inner.error(err);
    }

    pub fn timeout(&self, duration: Duration) {
        self.inner.timeout(duration);
    }

    pub(crate) fn ctx_mut(&mut self) -> &mut RequestCtx {
        self.inner.ctx_mut()
    }
}

/// A get request for a collection-typed resource.
pub struct CollectionRequest {
    pub(crate) inner: GetRequest,
}

impl Deref for CollectionRequest {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.inner.ctx.resource
    }
}

impl CollectionRequest {
    pub fn collection<T: Serialize>(&mut self, collection: T) {
        self.inner.collection(collection);
    }

    pub fn query_collection<T: Serialize>(&mut self, collection: T, query: &str) {
        self.inner.query_collection(collection, query);
    }

    pub fn not_found(&mut self) {
        self.inner.not_found();
    }

    pub fn invalid_query(&mut self, message: &str) {
        self.inner.invalid_query(message);
    }

    pub fn error(&mut self, err: &Error) {
        self.inner.error(err);
    }

    pub fn timeout(&self, duration: Duration) {
        self.inner.timeout(duration);
    }

    pub(crate) fn ctx_mut(&mut self) -> &mut RequestCtx {
        self.inner.ctx_mut()
    }
}

/// A call request for a method on a resource.
pub struct CallRequest {
    pub(crate) ctx: RequestCtx,
    pub(crate) method: String,
}

base_request_impl!(CallRequest);
http_origin_impl!(CallRequest);

impl CallRequest {
    /// The called method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Parses the raw params into `T`. Missing params parse as JSON
    /// `null`. Failures map to `system.invalidParams` suited for `?`-style
    /// short-circuiting.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, Error> {
        self.ctx.parse_params()
    }

    /// Replies with a result.
    pub fn ok<T: Serialize>(&mut self, result: T) {
        self.ctx.reply_result(result);
    }

    /// Replies with a reference to a resource (protocol >= 1.2).
    ///
    /// # Panics
    ///
    /// Panics if `rid` is not a valid resource ID; the recovery shim turns
    /// this into an internal error reply.
    pub fn resource(&mut self, rid: &str) {
        check_rid(rid);
        let payload = codec::resource_reply(rid, self.ctx.meta_opt());
        self.ctx.reply_raw(payload);
    }

    /// Replies with `system.methodNotFound`.
    pub fn method_not_found(&mut self) {
        self.ctx.reply_error(&Error::method_not_found());
    }

    /// Replies with `system.invalidParams`, optionally overriding the
    /// canonical message.
    pub fn invalid_params(&mut self, message: &str) {
        let err = if message.is_empty() {
            Error::invalid_params()
        } else {
            Error::new(codes::INVALID_PARAMS, message)
        };
        self.ctx.reply_error(&err);
    }

    /// Replies with `system.invalidQuery`, optionally overriding the
    /// canonical message.
    pub fn invalid_query(&mut self, message: &str) {
        let err = if message.is_empty() {
            Error::invalid_query()
        } else {
            Error::new(codes::INVALID_QUERY, message)
        };
        self.ctx.reply_error(&err);
    }
}

/// An auth request for an authentication method on a resource.
pub struct AuthRequest {
    pub(crate) ctx: RequestCtx,
    pub(crate) method: String,
}

base_request_impl!(AuthRequest);
http_origin_impl!(AuthRequest);

impl AuthRequest {
    /// The called authentication method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Parses the raw params into `T`.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, Error> {
        self.ctx.parse_params()
    }

    /// Replies with a result.
    pub fn ok<T: Serialize>(&mut self, result: T) {
        self.ctx.reply_result(result);
    }

    /// Replies with a reference to a resource (protocol >= 1.2).
    pub fn resource(&mut self, rid: &str) {
        check_rid(rid);
        let payload = codec::resource_reply(rid, self.ctx.meta_opt());
        self.ctx.reply_raw(payload);
    }

    /// Replies with `system.methodNotFound`.
    pub fn method_not_found(&mut self) {
        self.ctx.reply_error(&Error::method_not_found());
    }

    /// Replies with `system.invalidParams`, optionally overriding the
    /// canonical message.
    pub fn invalid_params(&mut self, message: &str) {
        let err = if message.is_empty() {
            Error::invalid_params()
        } else {
            Error::new(codes::INVALID_PARAMS, message)
        };
        self.ctx.reply_error(&err);
    }

    /// Publishes a token event resetting the access token of the
    /// connection this auth request originates from.
    ///
    /// # Panics
    ///
    /// Panics if the request carries no connection ID.
    pub fn token_event<T: Serialize>(&self, token: T) {
        let cid = self
            .ctx
            .dto
            .cid
            .as_deref()
            .unwrap_or_else(|| panic!("auth request without connection ID"));
        self.ctx.resource.service().send_token_event(cid, token);
    }
}

/// A legacy `new` call request, answered with a reference to the created
/// resource.
pub struct NewRequest {
    pub(crate) ctx: RequestCtx,
}

base_request_impl!(NewRequest);
http_origin_impl!(NewRequest);

impl NewRequest {
    /// Parses the raw params into `T`.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, Error> {
        self.ctx.parse_params()
    }

    /// Replies with a reference to the created resource.
    ///
    /// # Panics
    ///
    /// Panics if the reference is invalid; the recovery shim turns this
    /// into an internal error reply.
    pub fn new_ref(&mut self, r: Ref) {
        if !r.is_valid() {
            std::panic::panic_any(Error::new(
                codes::INTERNAL_ERROR,
                format!("Internal error: invalid reference {:?}", r.rid),
            ));
        }
        self.ctx.reply_result(r);
    }

    /// Replies with `system.invalidParams`, optionally overriding the
    /// canonical message.
    pub fn invalid_params(&mut self, message: &str) {
        let err = if message.is_empty() {
            Error::invalid_params()
        } else {
            Error::new(codes::INVALID_PARAMS, message)
        };
        self.ctx.reply_error(&err);
    }
}

fn check_rid(rid: &str) {
    if !is_valid_rid(rid, true) {
        std::panic::panic_any(Error::new(
            codes::INTERNAL_ERROR,
            format!("Internal error: invalid resource ID {rid:?}"),
        ));
    }
}
