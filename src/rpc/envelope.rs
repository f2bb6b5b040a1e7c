//! Envelope codec: the JSON shapes carried inside each frame.
//!
//! Two kinds of envelope share the stream:
//!
//! | Kind  | Shape                                                        |
//! |-------|--------------------------------------------------------------|
//! | call  | `{"method": str, "id": int, "params": [value, ...]}`         |
//! | reply | `{"id": int, "result": [value, ...] \| null, "error": {"message": str} \| null}` |
//!
//! An inbound object is a reply when it carries a `result` or `error` key,
//! and a call when it carries a `method`. Anything else is a protocol error
//! that the receiver loop logs and skips.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Method used by both sides to invoke a named procedure with a context tag.
pub const EVALUATE_METHOD: &str = "evaluate";

/// Outbound call envelope.
#[derive(Debug, Serialize)]
pub struct CallEnvelope<'a> {
    /// Peer method name.
    pub method: &'a str,
    /// Per-connection correlation id.
    pub id: u64,
    /// Positional parameters.
    pub params: &'a [Value],
}

/// Error body of a failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable failure description.
    pub message: String,
}

/// Reply envelope, used in both directions.
///
/// `id` is kept as a raw [`Value`] so that replies to peer-initiated calls
/// echo the peer's id exactly as it was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Id of the call being answered.
    #[serde(default)]
    pub id: Value,
    /// Result values on success.
    #[serde(default)]
    pub result: Option<Vec<Value>>,
    /// Error body on failure.
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

impl ReplyEnvelope {
    /// Successful reply carrying `values`.
    #[must_use]
    pub fn success(id: Value, values: Vec<Value>) -> Self {
        Self {
            id,
            result: Some(values),
            error: None,
        }
    }

    /// Failed reply carrying `message`.
    #[must_use]
    pub fn failure(id: Value, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                message: message.into(),
            }),
        }
    }

    /// Numeric id of a reply to one of our own calls.
    #[must_use]
    pub fn call_id(&self) -> Option<u64> {
        self.id.as_u64()
    }
}

/// Peer-initiated call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundCall {
    /// Method requested by the peer.
    pub method: String,
    /// Peer-side correlation id, echoed back in the reply.
    #[serde(default)]
    pub id: Value,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// A decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a call we issued.
    Reply(ReplyEnvelope),
    /// Call issued by the peer.
    Call(InboundCall),
}

/// Serialize an outbound call.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if a parameter cannot be serialized.
pub fn encode_call(method: &str, id: u64, params: &[Value]) -> Result<String> {
    Ok(serde_json::to_string(&CallEnvelope { method, id, params })?)
}

/// Serialize a reply.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if a result value cannot be serialized.
pub fn encode_reply(reply: &ReplyEnvelope) -> Result<String> {
    Ok(serde_json::to_string(reply)?)
}

/// Decode one frame into a reply or a call.
///
/// # Errors
///
/// - [`AppError::Protocol`]`("malformed json: …")`: not a JSON object.
/// - [`AppError::Protocol`]`("malformed reply: …")` or
///   `("malformed call: …")`: the object has the wrong field types for its kind.
/// - [`AppError::Protocol`]`("unrecognised envelope …")`: neither reply
///   keys nor a `method`.
pub fn decode(frame: &[u8]) -> Result<Inbound> {
    let object: Map<String, Value> = serde_json::from_slice(frame)
        .map_err(|e| AppError::Protocol(format!("malformed json: {e}")))?;

    if object.contains_key("result") || object.contains_key("error") {
        let reply = serde_json::from_value(Value::Object(object))
            .map_err(|e| AppError::Protocol(format!("malformed reply: {e}")))?;
        return Ok(Inbound::Reply(reply));
    }

    if object.contains_key("method") {
        let call = serde_json::from_value(Value::Object(object))
            .map_err(|e| AppError::Protocol(format!("malformed call: {e}")))?;
        return Ok(Inbound::Call(call));
    }

    Err(AppError::Protocol(
        "unrecognised envelope: no result, error, or method key".into(),
    ))
}

/// Build the parameter list of an `evaluate` call.
///
/// The procedure name goes first, the execution-context tag second (`false`
/// when no model scope applies), then the procedure's own arguments.
#[must_use]
pub fn evaluate_params(procedure: &str, model: Option<&str>, args: &[Value]) -> Vec<Value> {
    let mut params = Vec::with_capacity(args.len() + 2);
    params.push(Value::String(procedure.to_owned()));
    params.push(model.map_or(Value::Bool(false), |m| Value::String(m.to_owned())));
    params.extend_from_slice(args);
    params
}

/// Interpret the context slot of an inbound `evaluate` call.
///
/// `false` and `null` mean "no model scope"; strings name the model; any
/// other value is kept in its JSON text form.
#[must_use]
pub fn context_model(tag: Option<&Value>) -> Option<String> {
    match tag {
        None | Some(Value::Null | Value::Bool(false)) => None,
        Some(Value::String(name)) => Some(name.clone()),
        Some(other) => Some(other.to_string()),
    }
}
