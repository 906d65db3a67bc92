//! rsoemcrypto - device-side content-protection engine.
//!
//! This crate provides:
//! - Keybox and device certificate roots of trust.
//! - Session key derivation and signed license loading.
//! - CENC sample decryption (CTR, CBC and patterns) with key policy checks.
//! - Usage tables for offline licenses, with rollback-aware time.
//! - RSA device key provisioning and signing.
//!
//! Feature flags:
//! - `cli`: enable the CLI binary helpers.
//! - `log`: route internal logging through `log` (default).
//! - `tracing`: route internal logging through `tracing`.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Sample decryption and destination buffers.
pub mod cenc;
/// Time sources and rollback-corrected offline time.
pub mod clock;
/// Engine configuration and device capabilities.
pub mod config;
/// Key derivation and symmetric primitives.
pub mod crypto;
/// The engine and its external operations.
pub mod engine;
/// Common error types and Result alias.
pub mod error;
/// Key control blocks and loaded keys.
pub mod key;
/// Per-session key tables.
pub mod key_table;
/// Hardware keybox records.
pub mod keybox;
/// License messages and field spans.
pub mod message;
/// Nonce tracking and rate limiting.
pub mod nonce;
/// The device root of trust.
pub mod root;
/// Device RSA keys.
pub mod rsa_key;
/// Session state.
pub mod session;
/// Usage table and offline license state.
pub mod usage;

pub use engine::Engine;
pub use error::{Error, Result};
