//! Application-level error reporting shared by the binary and HTTP surfaces.

pub mod error;
