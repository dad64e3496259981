//! Internal error taxonomy and its translation to Cryptoki return codes.

use std::io;
use std::path::PathBuf;

use cryptoki_sys::{
    CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CKR_BUFFER_TOO_SMALL,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_GENERAL_ERROR,
    CKR_SESSION_HANDLE_INVALID, CKR_SLOT_ID_INVALID,
};
use thiserror::Error;

/// Everything that can go wrong inside the module.
///
/// Callers across the C boundary only ever see the [`TokenError::rv`]
/// translation; the specific cause is logged before it is collapsed.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("cannot load configuration from {path:?}: {source}")]
    Config { path: PathBuf, source: io::Error },

    #[error("module is not initialized")]
    NotInitialized,

    #[error("module is already initialized")]
    AlreadyInitialized,

    #[error("unknown slot {0}")]
    SlotInvalid(CK_SLOT_ID),

    #[error("invalid session handle {0}")]
    SessionInvalid(CK_SESSION_HANDLE),

    #[error("output buffer too small")]
    BufferTooSmall,

    #[error("cannot read key descriptor {path:?}: {reason}")]
    KeyFile { path: PathBuf, reason: String },

    #[error("unusable public area: {0}")]
    PublicArea(String),

    #[error("device returned an unsupported signature type")]
    SignatureType,

    #[error("tpm device failure: {0}")]
    Tpm(#[from] tss_esapi::Error),
}

impl TokenError {
    /// Total mapping onto the return codes the module reports.
    ///
    /// Device, file, and parse failures all collapse to the generic failure
    /// code; they carry detail for the log, not for the caller.
    pub fn rv(&self) -> CK_RV {
        match self {
            TokenError::NotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
            TokenError::AlreadyInitialized => CKR_CRYPTOKI_ALREADY_INITIALIZED,
            TokenError::SlotInvalid(_) => CKR_SLOT_ID_INVALID,
            TokenError::SessionInvalid(_) => CKR_SESSION_HANDLE_INVALID,
            TokenError::BufferTooSmall => CKR_BUFFER_TOO_SMALL,
            TokenError::Config { .. }
            | TokenError::KeyFile { .. }
            | TokenError::PublicArea(_)
            | TokenError::SignatureType
            | TokenError::Tpm(_) => CKR_GENERAL_ERROR,
        }
    }
}
