//! A PKCS#11 (Cryptoki) module exposing a single TPM 2.0 resident RSA key.
//!
//! Host applications load the compiled cdylib, call `C_GetFunctionList`,
//! and talk to one slot holding one token holding one key. The private key
//! never leaves the device: signing and decryption are delegated over the
//! configured transport, while the public half is served either from the
//! device or from a marshalled public-area file named in
//! `$HOME/.tpm2-token/config`.
//!
//! The exported C surface lives in [`pk11`]; everything else is the plumbing
//! behind it.

pub mod config;
pub mod error;
pub mod object;
pub mod pk11;
pub mod pubkey;
pub mod session;
pub mod token;
pub mod tpm;

pub use config::Config;
pub use error::TokenError;
