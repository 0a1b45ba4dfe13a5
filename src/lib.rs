//! Bazaar flip finder backend library
//!
//! Exposes the flip pipeline, caches and HTTP surface for the binary and
//! integration tests.

pub mod api;
pub mod cache;
pub mod config;
pub mod flippers;
pub mod middleware;
pub mod models;
pub mod scrapers;
