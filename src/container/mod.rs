//! Declarative container library, URL scoping, and DOM matching.

pub mod matcher;
pub mod registry;
pub mod schema;

pub use matcher::{MatchResult, Rect};
pub use registry::ContainerRegistry;
pub use schema::{ContainerDef, ContainerNode, OperationId, SelectorVariant};
