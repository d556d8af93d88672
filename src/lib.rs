//! Full-page HTTP response cache with post-cache CSRF token injection.
//!
//! The crate is organised in the same layers the binary wires together:
//!
//! - [`cache`]: namespace identity, key derivation, storage policy, stores and the
//!   caching middleware.
//! - [`csrf`]: the placeholder stage that swaps markers for fresh tokens on every
//!   outgoing response.
//! - [`config`]: layered settings (file, environment, CLI).
//! - [`infra`]: Postgres adapters, HTTP routers, upstream forwarding and telemetry.

pub mod application;
pub mod cache;
pub mod config;
pub mod csrf;
pub mod infra;
