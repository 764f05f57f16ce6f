//! API Module
//!
//! REST surface of the control plane.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
