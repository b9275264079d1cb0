//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for exercising the MQTT client
//! and relay without a running broker.

pub mod mocks;

pub use mocks::*;
