//! # Earshot Common Library
//!
//! Shared code for the Earshot friend tracker:
//! - Database initialization, schema, and models
//! - Event types (TrackerEvent enum)
//! - Configuration loading
//! - Error types
//! - Timestamp utilities

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
