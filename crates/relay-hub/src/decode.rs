//! Decoding bus payloads into unsequenced events.
//!
//! Two payload shapes are accepted:
//!
//! - **envelope**: `{"msg_type": "results", "session_id"?: .., "results": [{..}, ..]}`,
//!   one event per element of `results`;
//! - **plugin report**: `{"process": {"session_id", "status", ..}, "plugin": {"data_type", "type", ..}, ..}`,
//!   a single event whose result type is `data_type:type`.
//!
//! Reports with `"command": "ECHO"` are liveness probes and decode to nothing.

use relay_core::{Category, Event, RelayError, ResultType, SessionId};
use serde_json::{Map, Value};

/// Plugin status at which a job is complete.
const STATUS_COMPLETE: i64 = 100;

/// An event before the ingestor assigns its sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct EventDraft {
    /// What happened.
    pub category: Category,
    /// Owning session.
    pub session_id: SessionId,
    /// Routing tag.
    pub result_type: ResultType,
    /// Opaque body.
    pub payload: Value,
}

impl EventDraft {
    /// Stamp with a sequence number and source channel.
    pub fn into_event(self, sequence: u64, channel: &str) -> Event {
        Event {
            category: self.category,
            session_id: self.session_id,
            result_type: self.result_type,
            payload: self.payload,
            sequence,
            channel: channel.to_owned(),
        }
    }
}

/// Decode one bus payload. An empty vector means "nothing to distribute".
pub fn decode(payload: &[u8]) -> Result<Vec<EventDraft>, RelayError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| RelayError::MalformedMessage(format!("invalid JSON: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(malformed("payload is not an object"));
    };

    if obj
        .get("command")
        .and_then(Value::as_str)
        .is_some_and(|c| c.eq_ignore_ascii_case("ECHO"))
    {
        return Ok(Vec::new());
    }

    if obj.contains_key("msg_type") || obj.contains_key("results") {
        decode_envelope(&obj)
    } else if obj.contains_key("plugin") && obj.contains_key("process") {
        decode_report(obj).map(|draft| vec![draft])
    } else {
        Err(malformed("unrecognized message shape"))
    }
}

fn decode_envelope(obj: &Map<String, Value>) -> Result<Vec<EventDraft>, RelayError> {
    let category = match obj.get("msg_type") {
        Some(Value::String(t)) => Category::from_msg_type(t)
            .ok_or_else(|| malformed(format!("unknown msg_type {t:?}")))?,
        Some(_) => return Err(malformed("msg_type is not a string")),
        None => Category::ResultAdded,
    };
    let envelope_session = obj.get("session_id").and_then(session_of);

    let results = match obj.get("results") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(malformed("results is not a list")),
        None => return Err(malformed("missing results")),
    };

    results
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let Value::Object(entry) = item else {
                return Err(malformed(format!("results[{i}] is not an object")));
            };
            let session_id = entry
                .get("session_id")
                .and_then(session_of)
                .or_else(|| envelope_session.clone())
                .ok_or_else(|| malformed(format!("results[{i}] has no session_id")))?;
            let result_type = result_type_of(entry)
                .ok_or_else(|| malformed(format!("results[{i}] has no result_type")))?;
            Ok(EventDraft {
                category,
                session_id,
                result_type,
                payload: item.clone(),
            })
        })
        .collect()
}

fn decode_report(obj: Map<String, Value>) -> Result<EventDraft, RelayError> {
    let process = obj
        .get("process")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("process is not an object"))?;
    let plugin = obj
        .get("plugin")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("plugin is not an object"))?;

    let session_id = process
        .get("session_id")
        .and_then(session_of)
        .ok_or_else(|| malformed("process.session_id missing"))?;
    let data_type = plugin
        .get("data_type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("plugin.data_type missing"))?;
    let plugin_type = plugin
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("plugin.type missing"))?;
    let result_type = checked(ResultType::from_parts(data_type, plugin_type))
        .ok_or_else(|| malformed("plugin result type is blank or reserved"))?;

    let status = process.get("status").and_then(Value::as_i64);
    let category = match status {
        Some(s) if s < STATUS_COMPLETE => Category::JobStatus,
        _ => Category::ResultAdded,
    };

    Ok(EventDraft {
        category,
        session_id,
        result_type,
        payload: Value::Object(obj),
    })
}

fn session_of(value: &Value) -> Option<SessionId> {
    let id = match value {
        Value::String(s) => s.trim().to_owned(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then(|| SessionId::new(id))
}

fn result_type_of(entry: &Map<String, Value>) -> Option<ResultType> {
    if let Some(tag) = entry.get("result_type").and_then(Value::as_str) {
        return checked(ResultType::new(tag));
    }
    let data_type = entry.get("data_type").and_then(Value::as_str)?;
    let plugin_type = entry.get("plugin_type").and_then(Value::as_str)?;
    checked(ResultType::from_parts(data_type, plugin_type))
}

/// Upstream may not publish the wildcard sentinel or an empty tag.
fn checked(rt: ResultType) -> Option<ResultType> {
    (!rt.is_empty() && !rt.is_wildcard() && rt.as_str() != ":").then_some(rt)
}

fn malformed(reason: impl Into<String>) -> RelayError {
    RelayError::MalformedMessage(reason.into())
}
