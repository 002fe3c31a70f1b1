//! Capability registry.
//!
//! Indexes tools, prompts and resources discovered on each server and resolves
//! caller-supplied names to exactly one backend:
//! - Prefixed names (`server-tool`) always resolve to their owner
//! - Short names resolve only when a single permitted server reports them
//! - Everything else is `Ambiguous`, `PermissionDenied` or not found

pub mod index;
pub mod types;

pub use index::{CapabilityRegistry, RegistryCounts};
pub use types::{
    IndexedCapability, PromptDescriptor, QualifiedName, ResourceDescriptor, ServerInventory,
    ToolDescriptor,
};
