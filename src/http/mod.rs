//! HTTP layer for the organization cache.
//!
//! Cached resource paths and the top-repository views are answered from the
//! store; every other request goes through the [`proxy::ReverseProxy`] to the
//! upstream API.

pub mod handler;
pub mod middleware;
pub mod proxy;
