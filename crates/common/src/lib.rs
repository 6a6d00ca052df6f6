//! Error-context plumbing shared by all weft crates.

pub mod error;

pub use error::FromMessage;
