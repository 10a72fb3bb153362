// packages/engine/src/overlay/mod.rs
//! Read-only evidence overlay
//!
//! Each agent may have one immutable evidence log at
//! `<root>/<agent-id>.<extension>`. Snapshots are memory-mapped and never
//! written through; nothing in dispatch depends on them.

pub mod evidence;

pub use evidence::{EvidenceOverlay, Snapshot};
