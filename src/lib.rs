//! Bouncer - Brute-Force Protection Service
//!
//! This crate guards authentication endpoints against credential-stuffing and
//! brute-force attacks. Attempts are counted per identifier (client IP or
//! normalized account email) and action within a fixed window, and callers
//! that exceed the threshold are locked out until the window passes.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
