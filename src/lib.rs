#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::disallowed_types)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

//! Lifecycle and signing for a TPM resident application signing key (AppSK).
//!
//! The key is an RSA-2048 RSASSA-SHA256 signing key created under the owner
//! hierarchy storage primary and persisted at a fixed slot. [`keys::ensure`]
//! creates it once and reuses it afterwards, [`sign::sign`] signs with it
//! through the slot or a saved context, and [`keys::evict`] removes it.

pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod keys;
mod marshal;
pub mod primary;
pub mod provider;
pub mod session;
pub mod sign;
pub mod structures;
pub mod transport;
mod wrap;

#[cfg(test)]
mod tests;

pub use crate::config::Config;
pub use crate::context::ContextBlob;
pub use crate::error::{ErrorKind, ResponseCode, TpmError};
pub use crate::keys::{EnsureOptions, Evicted, KeyState, ProvisionedKey};
pub use crate::provider::{SoftTpm, Tpm};
pub use crate::session::Session;
pub use crate::sign::{KeySource, SignatureArtifact};
pub use crate::structures::PersistentHandle;
pub use crate::transport::TransportDescriptor;

#[cfg(feature = "tpm")]
pub use crate::provider::TssTpm;
