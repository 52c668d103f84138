//! In-process IPC between script runtimes.
//!
//! Messages crossing a runtime boundary are copied under the sender's
//! interpreter context before delivery, so the two scripts never share mutable
//! state. Strings are immutable and pass by reference; buffers are copied
//! byte-for-byte; objects and arrays are copied recursively with
//! function-valued fields becoming `undefined`.
//!
//! The channel also picks the event name the receiver will see: a disconnect
//! sentinel becomes `disconnect`, an object whose `cmd` field starts with
//! `NODE_` becomes `internalMessage`, everything else is a plain `message`.

use crate::error::RuntimeError;
use crate::value::ScriptValue;
use indexmap::IndexMap;

/// Event emitted for ordinary messages.
pub const EVENT_MESSAGE: &str = "message";
/// Event emitted for Node-internal control messages.
pub const EVENT_INTERNAL_MESSAGE: &str = "internalMessage";
/// Event emitted for the disconnect sentinel.
pub const EVENT_DISCONNECT: &str = "disconnect";

/// A message submitted to the IPC channel.
#[derive(Debug, Clone)]
pub enum IpcMessage {
    /// The channel is closing.
    Disconnect,
    /// A payload value.
    Value(ScriptValue),
}

/// Copies a message for delivery and selects the event name.
///
/// # Errors
///
/// Returns an internal invariant error for payload types the channel does not
/// carry (bare primitives and functions).
pub fn prepare(message: &IpcMessage) -> Result<(&'static str, ScriptValue), RuntimeError> {
    match message {
        IpcMessage::Disconnect => Ok((EVENT_DISCONNECT, ScriptValue::Undefined)),
        IpcMessage::Value(ScriptValue::String(s)) => {
            // Immutable, safe to share across runtimes.
            Ok((EVENT_MESSAGE, ScriptValue::String(s.clone())))
        }
        IpcMessage::Value(ScriptValue::Buffer(bytes)) => {
            // The sender may keep mutating its buffer after the send.
            Ok((EVENT_MESSAGE, ScriptValue::Buffer(bytes.clone())))
        }
        IpcMessage::Value(obj @ ScriptValue::Object(map)) => {
            let event = if is_internal_command(map) {
                EVENT_INTERNAL_MESSAGE
            } else {
                EVENT_MESSAGE
            };
            Ok((event, copy_value(obj)))
        }
        IpcMessage::Value(arr @ ScriptValue::Array(_)) => Ok((EVENT_MESSAGE, copy_value(arr))),
        IpcMessage::Value(other) => Err(RuntimeError::internal(format!(
            "unsupported IPC payload type: {other:?}"
        ))),
    }
}

fn is_internal_command(map: &IndexMap<String, ScriptValue>) -> bool {
    map.get("cmd")
        .and_then(ScriptValue::as_str)
        .is_some_and(|cmd| cmd.starts_with("NODE_"))
}

/// Structural copy sharing no mutable identity with the input.
fn copy_value(value: &ScriptValue) -> ScriptValue {
    match value {
        ScriptValue::Undefined => ScriptValue::Undefined,
        ScriptValue::Null => ScriptValue::Null,
        ScriptValue::Bool(b) => ScriptValue::Bool(*b),
        ScriptValue::Number(n) => ScriptValue::Number(*n),
        ScriptValue::String(s) => ScriptValue::String(s.clone()),
        ScriptValue::Buffer(bytes) => ScriptValue::Buffer(bytes.clone()),
        ScriptValue::Array(items) => ScriptValue::Array(items.iter().map(copy_value).collect()),
        ScriptValue::Object(map) => ScriptValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), copy_value(v)))
                .collect(),
        ),
        // Functions don't cross runtimes.
        ScriptValue::Function(_) => ScriptValue::Undefined,
    }
}
