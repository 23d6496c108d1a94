//! Core types, config, errors, state store and Kit wire protocol for kit-twin.

pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod types;
