//! # Manifold Studio core
//!
//! The collaborative parametric-CAD workspace's shared library: a CRDT tree
//! document, the room service that hosts it over HTTP/WebSocket, a client
//! sync layer and transclusion resolver, and the retained CSG evaluator that
//! turns a resolved tree into geometry.
//!
//! ## Architecture
//!
//! A client edit updates a local [`crdt::Document`] replica, which emits a
//! binary update ([`wire`]); the update is sent to the [`room`] service,
//! which appends it to a durable log, applies it, and broadcasts it to other
//! sockets. Each replica exposes a live [`csg::Node`] tree; [`client`]'s
//! transclusion resolver expands cross-room references, and [`evaluator`]
//! turns the resolved tree into a mesh plus a triangle-to-source-node map.

use std::collections::HashMap;

pub mod client;
pub mod config;
pub mod crdt;
pub mod csg;
pub mod error;
pub mod evaluator;
pub mod patcher;
pub mod room;
pub mod types;
pub mod wire;

pub use crdt::Document;
pub use csg::Node;
pub use error::{StudioError, StudioResult};

/// Crate version, as reported by `GET /rooms/{id}/history` diagnostics and
/// the service binary's `--version` flag.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A small diagnostic bundle, useful for logging at service startup.
pub fn version_info() -> HashMap<String, String> {
    let mut info = HashMap::new();
    info.insert("version".to_string(), VERSION.to_string());
    info.insert("name".to_string(), env!("CARGO_PKG_NAME").to_string());
    info.insert("target".to_string(), env!("BUILD_TARGET").to_string());
    info.insert("profile".to_string(), env!("BUILD_PROFILE").to_string());
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_reports_the_crate_version() {
        let info = version_info();
        assert_eq!(info.get("version").map(String::as_str), Some(VERSION));
    }
}
