// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{LucenaError, Result};
use crate::message::Message;

pub type Handler = Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// One `(pattern, handler)` binding plus the precomputed fields the
/// precedence order (spec §3) is sorted on:
///
/// 1. More properties in `pattern` wins.
/// 2. Tied on property count, the lexicographically smaller `sort_key` wins.
/// 3. Tied on both, a local handler wins over a remote one.
#[derive(Clone)]
pub struct HandlerEntry {
    pattern: Value,
    sort_key: String,
    is_local: bool,
    handler: Handler,
}

impl HandlerEntry {
    pub fn new(pattern: Value, is_local: bool, handler: Handler) -> Self {
        let sort_key = serde_json::to_string(&pattern).expect("pattern always serializes");
        HandlerEntry {
            pattern,
            sort_key,
            is_local,
            handler,
        }
    }

    fn property_count(&self) -> usize {
        self.pattern.as_object().map_or(0, |m| m.len())
    }

    /// Does every key/value in `pattern` also appear in `message`?
    fn matches(&self, message: &Message) -> bool {
        let Some(pattern) = self.pattern.as_object() else {
            return false;
        };
        pattern
            .iter()
            .all(|(k, v)| message.get(k) == Some(v))
    }

    /// Total order used to sort the handler list: earlier entries are tried
    /// first. Implements the three precedence rules as one `Ordering`.
    fn precedence_cmp(&self, other: &HandlerEntry) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        other
            .property_count()
            .cmp(&self.property_count())
            .then_with(|| self.sort_key.cmp(&other.sort_key))
            .then_with(|| match (self.is_local, other.is_local) {
                (true, false) => Less,
                (false, true) => Greater,
                _ => Equal,
            })
    }
}

/// An ordered collection of `HandlerEntry`, re-sorted on every `bind` so that
/// `resolve` can always take the first match in precedence order.
#[derive(Clone, Default)]
pub struct HandlerTable {
    entries: Vec<HandlerEntry>,
}

impl HandlerTable {
    pub fn new() -> Self {
        HandlerTable { entries: Vec::new() }
    }

    pub fn bind(&mut self, pattern: Value, is_local: bool, handler: Handler) {
        self.entries.push(HandlerEntry::new(pattern, is_local, handler));
        self.entries.sort_by(HandlerEntry::precedence_cmp);
    }

    /// Removes the first binding whose pattern equals `pattern` exactly.
    pub fn unbind(&mut self, pattern: &Value) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|e| &e.pattern == pattern)
            .ok_or(LucenaError::NoHandler)?;
        self.entries.remove(index);
        Ok(())
    }

    pub fn lookup(&self, message: &Message) -> Option<&HandlerEntry> {
        self.entries.iter().find(|e| e.matches(message))
    }

    pub fn resolve(&self, message: &Message) -> Result<Message> {
        let entry = self
            .lookup(message)
            .ok_or(LucenaError::NoHandler)?;
        Ok((entry.handler)(message))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reply shape shared by the default and stop built-ins: echo the request
/// back with the reserved keys overwritten.
pub fn default_handler(message: &Message) -> Message {
    message.merged([
        ("$rep".to_string(), Value::Null),
        ("$error".to_string(), Value::String("No handler match".into())),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;
    use serde_json::json;

    fn echo() -> Handler {
        Arc::new(|m: &Message| m.clone())
    }

    #[test]
    fn more_properties_win() {
        let mut table = HandlerTable::new();
        table.bind(json!({"a": 1}), true, echo());
        table.bind(json!({"a": 1, "b": 2}), true, echo());
        let msg = Message::new(json!({"a": 1, "b": 2, "c": 3})).unwrap();
        let matched = table.lookup(&msg).unwrap();
        check!(matched.property_count() == 2);
    }

    #[test]
    fn ties_break_alphabetically_then_local_over_remote() {
        let mut table = HandlerTable::new();
        table.bind(json!({"a": 1, "c": 3}), true, echo());
        table.bind(json!({"a": 1, "b": 2}), true, echo());
        let msg = Message::new(json!({"a": 1, "b": 2, "c": 3})).unwrap();
        let matched = table.lookup(&msg).unwrap();
        assert_eq!(matched.pattern, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn default_handler_wins_when_nothing_else_matches() {
        let mut table = HandlerTable::new();
        table.bind(json!({}), true, Arc::new(default_handler));
        table.bind(json!({"$req": "sum"}), true, echo());
        let msg = Message::new(json!({"$req": "unknown"})).unwrap();
        let reply = table.resolve(&msg).unwrap();
        assert_eq!(reply.get("$error"), Some(&json!("No handler match")));
    }

    #[test]
    fn resolve_errors_when_table_is_empty() {
        let table = HandlerTable::new();
        let msg = Message::new(json!({"$req": "anything"})).unwrap();
        assert!(matches!(table.resolve(&msg), Err(LucenaError::NoHandler)));
    }

    #[test]
    fn unbind_removes_exact_pattern() {
        let mut table = HandlerTable::new();
        table.bind(json!({"$req": "sum"}), true, echo());
        assert_eq!(table.len(), 1);
        table.unbind(&json!({"$req": "sum"})).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn unbind_errors_when_pattern_absent() {
        let mut table = HandlerTable::new();
        table.bind(json!({"$req": "sum"}), true, echo());
        assert!(matches!(
            table.unbind(&json!({"$req": "mul"})),
            Err(LucenaError::NoHandler)
        ));
    }
}
