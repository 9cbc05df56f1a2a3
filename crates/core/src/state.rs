// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde_json::Value;

/// Shared, thread-safe backing store for the built-in handlers every Worker
/// and Service dispatch loop carries (`$signal:"stop"`, `$req:"eval"`,
/// `$attr:"..."`). The original implementation read these off live Python
/// objects with `getattr`; a typed registry the owner populates explicitly
/// is the direct Rust equivalent.
#[derive(Debug, Default)]
pub struct IntrospectableState {
    stop_requested: AtomicBool,
    attributes: RwLock<HashMap<String, Value>>,
}

impl IntrospectableState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: Value) {
        self.attributes
            .write()
            .expect("attribute lock poisoned")
            .insert(name.into(), value);
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes
            .read()
            .expect("attribute lock poisoned")
            .get(name)
            .cloned()
    }

    /// Snapshot of every registered attribute, the body of `$req:"eval"`'s
    /// reply when no single `$attr` was named.
    pub fn all_attributes(&self) -> HashMap<String, Value> {
        self.attributes.read().expect("attribute lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stop_flag_is_observable_across_handles() {
        let state = IntrospectableState::new();
        assert!(!state.stop_requested());
        state.request_stop();
        assert!(state.stop_requested());
    }

    #[test]
    fn attributes_round_trip() {
        let state = IntrospectableState::new();
        state.set_attribute("totalClientRequests", json!(3));
        assert_eq!(state.attribute("totalClientRequests"), Some(json!(3)));
        assert_eq!(state.attribute("missing"), None);
    }
}
