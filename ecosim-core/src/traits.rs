//! Core trait definitions for the ecosim workspace.

/// A type that can produce a summary of its contents.
pub trait Summarizable {
    /// A one-line summary suitable for display.
    fn summary(&self) -> String;
}

/// A type that carries a numeric score (likelihood, support, etc.).
pub trait Scored {
    /// The score value.
    fn score(&self) -> f64;
}
