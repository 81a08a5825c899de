//! `mofa-adaptive`: hardware-adaptive model memory management.
//!
//! See [`adaptive`] for the component overview.

pub mod adaptive;

pub use adaptive::{AdaptiveRuntime, Capability, RuntimeConfig, Tier};
