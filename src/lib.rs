//! Tollgate - Policy-Based Admission Control
//!
//! This crate throttles clients per named policy using fixed-window counters
//! kept in a shared Redis store, falling back to process-local memory when
//! Redis cannot be reached. It also exposes the JSON cache facade built on
//! the same store and an axum layer that gates routes by policy.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
