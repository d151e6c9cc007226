//! Wire encoding shared by the client channels and the dispatcher.
//!
//! - QUERY / SUBSCRIPTION: `GET /_api/<service>/<procedure>?payload=<json>`
//! - MUTATION: `POST /_api/<service>/<procedure>` with a JSON body
//! - success: `200 {"data": <output>}`; failure: non-2xx with a text body
//! - duplex failure payload: `{"_error": "<text>"}`

use crate::config::WireConfig;
use crate::error::{Result, RpcError};
use crate::validate::{ValidationFailure, Violation};
use serde_json::{json, Value};

/// Path of a procedure relative to the server root.
pub fn procedure_path(service: &str, procedure: &str) -> String {
    format!("{}/{}/{}", WireConfig::API_PREFIX, service, procedure)
}

/// Append the URL-encoded payload parameter to `endpoint`.
pub(crate) fn with_payload(endpoint: &str, payload: &Value) -> Result<url::Url> {
    let mut url = url::Url::parse(endpoint).map_err(|e| RpcError::Config {
        message: format!("Invalid endpoint {}: {}", endpoint, e),
    })?;
    url.query_pairs_mut()
        .append_pair(WireConfig::PAYLOAD_PARAM, &payload.to_string());
    Ok(url)
}

/// Decode the payload parameter of a GET request. A missing parameter is
/// the empty object.
pub(crate) fn decode_payload(procedure: &str, raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(json!({})),
        Some(raw) => serde_json::from_str(raw).map_err(|e| RpcError::InvalidInput {
            procedure: procedure.to_string(),
            failure: ValidationFailure {
                violations: vec![Violation {
                    path: "$".to_string(),
                    message: format!("malformed JSON: {}", e),
                }],
            },
        }),
    }
}

/// Wrap a one-shot result in the success envelope.
pub(crate) fn success_envelope(data: Value) -> Value {
    json!({ (WireConfig::DATA_FIELD): data })
}

/// Pull the result out of a success envelope.
pub(crate) fn extract_data(body: &[u8]) -> Result<Value> {
    let mut envelope: Value =
        serde_json::from_slice(body).map_err(|e| RpcError::MalformedResponse {
            message: format!("response is not JSON: {}", e),
        })?;

    envelope
        .as_object_mut()
        .and_then(|fields| fields.remove(WireConfig::DATA_FIELD))
        .ok_or_else(|| RpcError::MalformedResponse {
            message: format!("response has no `{}` field", WireConfig::DATA_FIELD),
        })
}

/// Encode an application-level failure for a duplex connection.
pub(crate) fn failure_frame(message: &str) -> String {
    json!({ (WireConfig::ERROR_FIELD): message }).to_string()
}

/// Recognize a failure payload: an object whose only field is `_error`.
pub(crate) fn parse_failure_frame(value: &Value) -> Option<String> {
    let fields = value.as_object()?;
    if fields.len() != 1 {
        return None;
    }
    fields
        .get(WireConfig::ERROR_FIELD)?
        .as_str()
        .map(str::to_string)
}
