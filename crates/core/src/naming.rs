// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use uuid::Uuid;

/// A fresh `inproc://` endpoint name. `inproc` requires the bind side to
/// issue its `bind()` before any peer calls `connect()`, so every internal
/// pairing (signal pair, worker pool router) mints one of these rather than
/// sharing a well-known address.
pub fn unique_endpoint() -> String {
    format!("inproc://lucena-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_unique_and_well_formed() {
        let a = unique_endpoint();
        let b = unique_endpoint();
        assert_ne!(a, b);
        assert!(a.starts_with("inproc://lucena-"));
    }
}
