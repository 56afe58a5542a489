//! Core runtime for Resly, a framework for writing RES (Resgate) services
//! over a subject-based message broker.
//!
//! A service registers handlers for hierarchical resource patterns, serves
//! the RES request types (access, get, call, auth) with exactly one reply
//! per request, and emits resource events. Handlers for the same resource
//! group never run concurrently; different groups run in parallel on a
//! bounded worker pool.
//!
//! ```ignore
//! use resly_core::{Handler, Service};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Service::new("example");
//!     service.handle(
//!         "model",
//!         Handler::new()
//!             .access(|r| {
//!                 r.access_granted();
//!                 Ok(())
//!             })
//!             .get_model(|r| {
//!                 r.model(serde_json::json!({"message": "hello"}));
//!                 Ok(())
//!             }),
//!     );
//!     let conn = resly_nats::NatsConn::connect("nats://127.0.0.1:4222").await?;
//!     service.serve(conn).await?;
//!     Ok(())
//! }
//! ```

mod codec;
mod conn;
mod dispatch;
mod error;
mod event;
mod gexpr;
mod handler;
mod mux;
mod pattern;
mod query;
mod request;
mod resource;
mod service;
mod types;

pub use conn::{Conn, ConnEvent, RawMessage, Subscription};
pub use error::{codes, ConnError, Error, ServiceError};
pub use event::ResourceEvent;
pub use handler::{Handler, ResourceType};
pub use mux::Mux;
pub use pattern::{is_valid_rid, is_valid_rname, Pattern};
pub use query::QueryRequest;
pub use request::{
    AccessRequest, AuthRequest, CallRequest, CollectionRequest, GetRequest, ModelRequest,
    NewRequest,
};
pub use resource::Resource;
pub use service::{Service, PROTOCOL_VERSION};
pub use types::{delete_action, DataValue, Ref, SoftRef};
