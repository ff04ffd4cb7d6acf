//! CRDT implementation for a Manifold Studio document (§3.2, §4.6).
//!
//! A document is a tree CRDT whose single root is a `group`; each CSG node
//! maps one-to-one to a tree node whose [`attrs::AttrMap`] holds the node's
//! scalar/array properties under Last-Writer-Wins resolution, and whose
//! position in [`tree::TreeCrdt`] encodes parent/child and ordering.
//! [`change`] tracks the causal history that makes peers' edits composable,
//! [`document`] ties tree + history into the thing a room service or client
//! holds one of, and [`merge_points`] turns that history into the UI's
//! linear, chunked view of convergence.

pub mod attrs;
pub mod change;
pub mod document;
pub mod merge_points;
pub mod tree;

pub use document::{Document, ROOT_ID};
