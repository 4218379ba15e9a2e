//! Shared utilities for gpibmux

pub mod sleep;

pub use sleep::*;
