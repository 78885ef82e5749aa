//! Resource graph module.
//!
//! This module handles:
//! - Resource addresses and references
//! - Attribute values with nested references
//! - Graph construction from resource definitions
//! - Deterministic dependency ordering and cycle detection

mod address;
mod builder;
mod resolver;
mod value;

pub use address::{is_valid_segment, Address, Reference};
pub use builder::{DependencyEdge, GraphBuilder, ResourceDefinition, ResourceGraph};
pub use resolver::{DependencyResolver, ExecutionOrder};
pub use value::{resolve_attributes, AttributeValue, Attributes};
