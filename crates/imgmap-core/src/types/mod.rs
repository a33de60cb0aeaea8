//! # Types
//!
//! Small shared types used throughout the crate.
//!
//! These abstract away which data source (dump or live process) backs the
//! target, so the module directory and memory services only ever see an
//! address and a [`TargetDescriptor`].

pub mod address;
pub mod target;

// Re-export all public types
pub use address::Address;
pub use target::{OperatingSystem, TargetDescriptor};
