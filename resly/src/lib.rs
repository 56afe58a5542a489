//! Resly: a framework for writing RES (Resgate) real-time API services
//! over a subject-based message broker.
//!
//! This facade re-exports the framework core and the NATS broker adapter.
//! See [`resly_core`] for the full API documentation.

pub use resly_core::{
    codes, delete_action, is_valid_rid, is_valid_rname, AccessRequest, AuthRequest, CallRequest,
    CollectionRequest, Conn, ConnError, ConnEvent, DataValue, Error, GetRequest, Handler,
    ModelRequest, Mux, NewRequest, Pattern, QueryRequest, RawMessage, Ref, Resource,
    ResourceEvent, ResourceType, Service, ServiceError, SoftRef, Subscription, PROTOCOL_VERSION,
};

pub use resly_nats::NatsConn;
