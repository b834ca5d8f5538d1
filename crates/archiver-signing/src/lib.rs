//! PAdES signing and RFC3161 timestamp client (C9, C10).
//!
//! [`tsa`] implements the timestamp-authority request/response exchange;
//! [`signer`] loads PKCS#12 signing material and applies a detached CMS
//! signature, optionally embedding a timestamp token from [`tsa`].

pub mod signer;
pub mod tsa;

pub use signer::{SigningConfig, Signer, SIGNATURE_PLACEHOLDER};
pub use tsa::{TsaBasicAuth, TsaConfig};
