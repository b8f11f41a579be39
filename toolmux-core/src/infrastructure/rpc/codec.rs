//! JSON-RPC frame codec.
//!
//! Frames are single JSON objects; the transport adds and strips the newline
//! delimiter. Decoding classifies an object as request, response or
//! notification by the presence of `id`, `method`, `result` and `error`.

use super::types::{Incoming, RequestId, RpcError, RpcNotification, RpcRequest, RpcResponse};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(String),
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has an invalid id: {0}")]
    InvalidId(String),
    #[error("frame has a non-string method")]
    InvalidMethod,
    #[error("frame has neither id nor method")]
    Unclassifiable,
    #[error("response {0} carries both result and error")]
    AmbiguousResponse(RequestId),
    #[error("response {0} carries neither result nor error")]
    EmptyResponse(RequestId),
    #[error("response error object is malformed: {0}")]
    InvalidErrorObject(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

pub fn encode_request(id: u64, method: &str, params: Value) -> Result<Vec<u8>, CodecError> {
    encode(&RpcRequest::new(RequestId::Number(id), method, params))
}

pub fn encode_notification(method: &str, params: Value) -> Result<Vec<u8>, CodecError> {
    encode(&RpcNotification::new(method, params))
}

pub fn encode_response(response: &RpcResponse) -> Result<Vec<u8>, CodecError> {
    encode(response)
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(|err| CodecError::Encode(err.to_string()))
}

/// Decodes one frame. An error means the frame should be discarded.
pub fn decode(frame: impl AsRef<[u8]>) -> Result<Incoming, CodecError> {
    let text = std::str::from_utf8(frame.as_ref())
        .map_err(|err| CodecError::InvalidUtf8(err.to_string()))?;
    let value: Value =
        serde_json::from_str(text).map_err(|err| CodecError::InvalidJson(err.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(CodecError::NotAnObject);
    };

    let id = take_id(&mut object)?;
    let method = match object.remove("method") {
        None => None,
        Some(Value::String(method)) => Some(method),
        Some(_) => return Err(CodecError::InvalidMethod),
    };
    let params = object.remove("params").unwrap_or(Value::Null);

    match (id, method) {
        (Some(id), Some(method)) => Ok(Incoming::Request { id, method, params }),
        (None, Some(method)) => Ok(Incoming::Notification { method, params }),
        (Some(id), None) => decode_response(id, object),
        (None, None) => match object.remove("error") {
            Some(error) => Ok(Incoming::Uncorrelated(parse_error(error)?)),
            None => Err(CodecError::Unclassifiable),
        },
    }
}

fn take_id(object: &mut JsonMap<String, Value>) -> Result<Option<RequestId>, CodecError> {
    match object.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value::<RequestId>(raw.clone())
            .map(Some)
            .map_err(|_| CodecError::InvalidId(raw.to_string())),
    }
}

fn decode_response(
    id: RequestId,
    mut object: JsonMap<String, Value>,
) -> Result<Incoming, CodecError> {
    let result = object.remove("result");
    let error = object.remove("error");
    let outcome = match (result, error) {
        (Some(_), Some(_)) => return Err(CodecError::AmbiguousResponse(id)),
        (None, None) => return Err(CodecError::EmptyResponse(id)),
        (Some(result), None) => Ok(result),
        (None, Some(error)) => Err(parse_error(error)?),
    };
    Ok(Incoming::Response { id, outcome })
}

fn parse_error(error: Value) -> Result<RpcError, CodecError> {
    serde_json::from_value(error).map_err(|err| CodecError::InvalidErrorObject(err.to_string()))
}
