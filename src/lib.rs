//! Abuse Shield
//!
//! Request-screening layer that sits in front of an HTTP application and
//! rejects, throttles or sanitizes incoming traffic.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
