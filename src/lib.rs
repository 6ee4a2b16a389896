//! Hostgate - A host-based reverse proxy for Docker containers
//!
//! This library provides a gateway that:
//! - Discovers running containers and routes HTTP traffic to them by Host header
//! - Keys routes on a container's `DOMAIN` variable, a generated subdomain, or its id
//! - Follows container lifecycle events to keep the routing table current
//! - Spreads requests randomly across containers sharing a routing key
//! - Serves debug endpoints for routes, container logs, environment and files

pub mod admin;
pub mod config;
pub mod container;
pub mod destination;
pub mod docker;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod listener;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod server;
