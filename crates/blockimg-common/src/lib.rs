//! blockimg Common - Shared types and utilities
//!
//! This crate provides the identifiers, data model, error taxonomy and
//! configuration used by the image control plane.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
