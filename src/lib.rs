//! Crate-drop engine library
//!
//! Location signal processing and proximity-triggered collection.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod error;
pub mod infra;
pub mod io;
pub mod services;
