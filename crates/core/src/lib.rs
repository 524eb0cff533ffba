//! Shared types and pure helpers for the vidpool platform.
//!
//! This crate has zero internal dependencies and holds only plain data
//! types plus pure functions: credential cookie-export handling and
//! unverified JWT claim decoding.

pub mod cookies;
pub mod jwt;
pub mod types;
