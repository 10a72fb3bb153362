// packages/engine/src/registry/mod.rs
//! Agent registry
//!
//! - **Descriptor**: what an agent declares about itself (capabilities,
//!   latency budget, reliability tier, deployment reference)
//! - **Registry**: concurrent upsert map consulted by the selector
//! - **Loader**: bulk load of descriptor records from a directory
//! - **Store**: SQLite persistence for runtime registrations

pub mod descriptor;
pub mod loader;
pub mod registry;
pub mod store;

pub use descriptor::{AgentDescriptor, ReliabilityTier};
pub use loader::load_descriptor_dir;
pub use registry::{Registration, Registry};
pub use store::DescriptorStore;
