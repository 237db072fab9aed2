//! Kiln Core
//!
//! Domain types, store ports, and error handling for the kiln scheduling
//! engine. Every other crate in the workspace speaks this vocabulary.

pub mod change;
pub mod error;
pub mod ids;
pub mod ports;
pub mod request;

pub use error::{Error, Result};
pub use ids::*;
