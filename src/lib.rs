//! dockgate - A reverse proxy that discovers its backends from Docker
//!
//! This library provides a gateway that:
//! - Watches running containers and reads their routing declaration from
//!   an environment variable (`DOCKGATE_HOSTS` by default)
//! - Routes HTTP traffic by Host header, with exact and `*` wildcard
//!   hostname patterns and round-robin across every matching container
//! - Requests TLS certificates via ACME on demand, only for hostnames a
//!   running container lists in `DOCKGATE_LETSENCRYPT`
//! - Uses connection pooling for efficient backend communication

pub mod acme;
pub mod config;
pub mod discovery;
pub mod docker;
pub mod error;
pub mod loadbalancer;
pub mod pattern;
pub mod pool;
pub mod proxy;
pub mod registry;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Value of the `Server` header on every response
pub const SERVER_NAME: &str = concat!("dockgate/", env!("CARGO_PKG_VERSION"));
