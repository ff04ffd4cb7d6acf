//! The room service: per-room authoritative replicas over a shared SQLite
//! key-value store, exposed over HTTP and WebSocket (§4.4, §6).

pub mod http;
pub mod service;
pub mod storage;

pub use http::{router, AppState};
pub use service::RoomRegistry;
