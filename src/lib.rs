//! Adaptive throttling service.
//!
//! Learns normal traffic per dimension (visits, attacks, errors) and tunes
//! the rate-limit thresholds consumed by the flow controller.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
