//! Shared primitives and traits for the ecosim ecotype demarcation workspace.
//!
//! `ecosim-core` provides the foundation the domain crates build on:
//!
//! - **Error types**: [`EcosimError`] and [`Result`] for structured error handling
//! - **Traits**: [`Summarizable`] and [`Scored`]

pub mod error;
pub mod traits;

pub use error::{EcosimError, Result};
pub use traits::*;
