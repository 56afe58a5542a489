//! Wire shapes of the RES service protocol.
//!
//! Inbound request payloads are decoded into [`RequestDto`] with the params
//! and token kept raw until a handler asks for them. Outbound replies and
//! events are built here so the shapes live in one place.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::error::Error;

/// Decoded inbound request payload. Every field is optional on the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RequestDto {
    pub cid: Option<String>,
    pub params: Option<Box<RawValue>>,
    pub token: Option<Box<RawValue>>,
    pub header: Option<HashMap<String, Vec<String>>>,
    pub host: Option<String>,
    #[serde(rename = "remoteAddr")]
    pub remote_addr: Option<String>,
    pub uri: Option<String>,
    pub query: Option<String>,
}

impl RequestDto {
    /// An HTTP-originated request carries at least one of the HTTP fields.
    pub(crate) fn is_http(&self) -> bool {
        self.header.is_some() || self.host.is_some() || self.uri.is_some()
    }
}

/// Response meta information for HTTP-originated requests.
#[derive(Debug, Default, Clone, Serialize)]
pub(crate) struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<HashMap<String, Vec<String>>>,
}

impl Meta {
    pub(crate) fn is_empty(&self) -> bool {
        self.status.is_none() && self.header.is_none()
    }
}

#[derive(Serialize)]
struct ResultReply<'a, T: Serialize> {
    result: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a Meta>,
}

#[derive(Serialize)]
struct ResourceReply<'a> {
    resource: crate::types::Ref,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a Meta>,
}

#[derive(Serialize)]
struct ErrorReply<'a> {
    error: &'a Error,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a Meta>,
}

pub(crate) fn result_reply<T: Serialize>(
    result: T,
    meta: Option<&Meta>,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&ResultReply { result, meta })
}

pub(crate) fn resource_reply(rid: &str, meta: Option<&Meta>) -> Vec<u8> {
    serde_json::to_vec(&ResourceReply {
        resource: crate::types::Ref::new(rid),
        meta,
    })
    .expect("resource reply serialization cannot fail")
}

pub(crate) fn error_reply(err: &Error, meta: Option<&Meta>) -> Vec<u8> {
    serde_json::to_vec(&ErrorReply { error: err, meta })
        .unwrap_or_else(|_| b"{\"error\":{\"code\":\"system.internalError\",\"message\":\"Internal error\"}}".to_vec())
}

/// The out-of-band directive asking the gateway to extend its wait.
pub(crate) fn timeout_directive(ms: u128) -> Vec<u8> {
    format!("timeout:\"{ms}\"").into_bytes()
}

/// Access request result: `{"get": bool, "call": "<csv-or-*>"}`.
#[derive(Serialize)]
pub(crate) struct AccessResult<'a> {
    pub get: bool,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub call: &'a str,
}

/// Get request result wrapping a model: `{"model": …, "query"?: …}`.
#[derive(Serialize)]
pub(crate) struct ModelResult<T: Serialize> {
    pub model: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Get request result wrapping a collection: `{"collection": …, "query"?: …}`.
#[derive(Serialize)]
pub(crate) struct CollectionResult<T: Serialize> {
    pub collection: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct ChangeEventPayload<'a> {
    pub values: &'a HashMap<String, Value>,
}

#[derive(Serialize)]
pub(crate) struct AddEventPayload<'a> {
    pub value: &'a Value,
    pub idx: usize,
}

#[derive(Serialize)]
pub(crate) struct RemoveEventPayload {
    pub idx: usize,
}

#[derive(Serialize)]
pub(crate) struct TokenEventPayload<T: Serialize> {
    pub token: T,
}

#[derive(Serialize)]
pub(crate) struct QueryEventPayload<'a> {
    pub subject: &'a str,
}

/// Inbound query request payload on a query-event inbox subject.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct QueryRequestDto {
    pub query: Option<String>,
}

/// One entry of a query reply's ordered event list.
#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct QueryEventEntry {
    pub event: String,
    pub data: Value,
}

#[derive(Serialize)]
pub(crate) struct QueryEventsResult<'a> {
    pub events: &'a [QueryEventEntry],
}

/// `system.reset` payload listing owned resource and access patterns.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct SystemReset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_dto_decodes_partial_payloads() {
        let dto: RequestDto =
            serde_json::from_str(r#"{"cid":"c42","query":"limit=10"}"#).unwrap();
        assert_eq!(dto.cid.as_deref(), Some("c42"));
        assert_eq!(dto.query.as_deref(), Some("limit=10"));
        assert!(dto.params.is_none());
        assert!(!dto.is_http());
    }

    #[test]
    fn request_dto_keeps_params_raw() {
        let dto: RequestDto = serde_json::from_str(r#"{"params":{"value":21}}"#).unwrap();
        assert_eq!(dto.params.unwrap().get(), r#"{"value":21}"#);
    }

    #[test]
    fn http_origin_detection() {
        let dto: RequestDto =
            serde_json::from_str(r#"{"header":{"Cookie":["a=b"]},"host":"h"}"#).unwrap();
        assert!(dto.is_http());
    }

    #[test]
    fn result_reply_shape() {
        let bytes = result_reply(serde_json::json!(42), None).unwrap();
        assert_eq!(bytes, br#"{"result":42}"#);
    }

    #[test]
    fn result_reply_with_meta() {
        let meta = Meta {
            status: Some(204),
            header: None,
        };
        let bytes = result_reply(Value::Null, Some(&meta)).unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v, serde_json::json!({"result": null, "meta": {"status": 204}}));
    }

    #[test]
    fn error_reply_shape() {
        let bytes = error_reply(&Error::not_found(), None);
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"error": {"code": "system.notFound", "message": "Not found"}})
        );
    }

    #[test]
    fn access_result_omits_empty_call() {
        let v = serde_json::to_value(AccessResult {
            get: true,
            call: "",
        })
        .unwrap();
        assert_eq!(v, serde_json::json!({"get": true}));
        let v = serde_json::to_value(AccessResult {
            get: true,
            call: "*",
        })
        .unwrap();
        assert_eq!(v, serde_json::json!({"get": true, "call": "*"}));
    }

    #[test]
    fn timeout_directive_shape() {
        assert_eq!(timeout_directive(30000), b"timeout:\"30000\"".to_vec());
    }

    #[test]
    fn system_reset_omits_absent_lists() {
        let bytes = serde_json::to_vec(&SystemReset {
            resources: Some(vec!["lib.>".to_string()]),
            access: None,
        })
        .unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v, serde_json::json!({"resources": ["lib.>"]}));
    }
}
