//! Domain layer - Core types and port definitions
//!
//! This module defines the identity scheme, the stored entities and their
//! client projections, and the core traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod entities;
pub mod identity;
pub mod ports;

pub use entities::*;
pub use identity::*;
pub use ports::*;
