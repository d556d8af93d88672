//! CSRF placeholder substitution.
//!
//! The origin renders a marker (default `__CSRF__`, optionally `__CSRF__#intent`)
//! wherever a token belongs, so the page stays cacheable. This stage replaces the
//! markers with fresh 64-hex tokens on the way out.

mod config;
mod middleware;
pub mod placeholder;
pub mod tokens;

pub use config::{CsrfConfig, DEFAULT_MARKER};
pub use middleware::{CsrfPlaceholderHandler, csrf_placeholder_layer};
pub use placeholder::{Substitution, TokenReuse};
pub use tokens::{
    REQUEST_ID_HEADER, RandomTokenGenerator, TokenContext, TokenGenerator, is_well_formed,
};
