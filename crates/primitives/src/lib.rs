//! Shared constants and types for the dynamic code loader.

pub mod consts;
pub mod types;

pub use types::{ContractId, ContractIdParseError, GeometryError, MemoryGeometry};
