// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use serde_json::{Map, Value};

use crate::error::LucenaError;

/// Reserved keys in the message JSON object (spec §3).
pub const KEY_REQ: &str = "$req";
pub const KEY_REP: &str = "$rep";
pub const KEY_SIGNAL: &str = "$signal";
pub const KEY_ERROR: &str = "$error";
pub const KEY_ATTR: &str = "$attr";
pub const KEY_PARAM: &str = "$param";

pub const SIGNAL_READY: &str = "ready";
pub const SIGNAL_STOP: &str = "stop";

/// A message is a JSON object. `Message` wraps the value so that every
/// caller works with `serde_json::Map` access instead of re-checking
/// `Value::Object` at each call site.
#[derive(Debug, Clone, PartialEq)]
pub struct Message(Value);

impl Message {
    /// Builds a message from a JSON object, rejecting anything else.
    pub fn new(value: Value) -> crate::error::Result<Self> {
        if value.is_object() {
            Ok(Message(value))
        } else {
            Err(LucenaError::MalformedPayload(
                "message body is not a JSON object".into(),
            ))
        }
    }

    pub fn object(fields: Map<String, Value>) -> Self {
        Message(Value::Object(fields))
    }

    pub fn empty() -> Self {
        Message(Value::Object(Map::new()))
    }

    pub fn ready_signal() -> Self {
        let mut m = Map::new();
        m.insert(KEY_SIGNAL.to_string(), Value::String(SIGNAL_READY.into()));
        Message(Value::Object(m))
    }

    pub fn stop_signal() -> Self {
        let mut m = Map::new();
        m.insert(KEY_SIGNAL.to_string(), Value::String(SIGNAL_STOP.into()));
        Message(Value::Object(m))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_object(&self) -> &Map<String, Value> {
        self.0
            .as_object()
            .expect("Message invariant: body is always a JSON object")
    }

    fn as_object_mut(&mut self) -> &mut Map<String, Value> {
        self.0
            .as_object_mut()
            .expect("Message invariant: body is always a JSON object")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.as_object_mut().insert(key.to_string(), value);
    }

    /// Returns a copy of `self` with `fields` merged in, later keys winning —
    /// the shape every built-in handler uses to answer ("echo the request,
    /// then stamp `$rep`/`$error`/`$signal`").
    pub fn merged(&self, fields: impl IntoIterator<Item = (String, Value)>) -> Message {
        let mut out = self.as_object().clone();
        for (k, v) in fields {
            out.insert(k, v);
        }
        Message(Value::Object(out))
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.0).expect("JSON object always serializes")
    }

    pub fn from_json_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| LucenaError::MalformedPayload(e.to_string()))?;
        Message::new(value)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(fields: Map<String, Value>) -> Self {
        Message::object(fields)
    }
}
