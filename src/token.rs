//! Fixed slot, token, and library identity reported to callers.

use cryptoki_sys::{
    CK_INFO, CK_OBJECT_HANDLE, CK_SESSION_INFO, CK_SLOT_ID, CK_SLOT_INFO, CK_TOKEN_INFO,
    CK_VERSION, CKF_SERIAL_SESSION, CKF_TOKEN_INITIALIZED, CKF_TOKEN_PRESENT,
    CKS_RO_USER_FUNCTIONS,
};

/// The one slot the module exposes.
pub const SLOT_ID: CK_SLOT_ID = 0x1234;

/// Handle of the one key object behind the slot.
pub const KEY_OBJECT: CK_OBJECT_HANDLE = 1;

/// Identity bytes reported for both the id and label attributes.
pub const KEY_ID: [u8; 8] = *b"tpm2-key";

/// Cryptoki revision the function list implements.
pub const CRYPTOKI_VERSION: CK_VERSION = CK_VERSION { major: 2, minor: 40 };

const LIBRARY_VERSION: CK_VERSION = CK_VERSION { major: 0, minor: 1 };
const NULL_VERSION: CK_VERSION = CK_VERSION { major: 0, minor: 0 };

const MANUFACTURER: &str = "tpm2-token";
const LIBRARY_DESCRIPTION: &str = "TPM2 token module";
const SLOT_DESCRIPTION: &str = "TPM2 token slot";
const TOKEN_LABEL: &str = "TPM2 token";
const TOKEN_MODEL: &str = "TPM2";
const TOKEN_SERIAL: &str = "0000000000000001";

/// Copy `text` into a space-padded fixed-width field, truncating if needed.
pub fn space_padded<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [b' '; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

pub fn library_info() -> CK_INFO {
    CK_INFO {
        cryptokiVersion: CRYPTOKI_VERSION,
        manufacturerID: space_padded(MANUFACTURER),
        flags: 0,
        libraryDescription: space_padded(LIBRARY_DESCRIPTION),
        libraryVersion: LIBRARY_VERSION,
    }
}

pub fn slot_info() -> CK_SLOT_INFO {
    CK_SLOT_INFO {
        slotDescription: space_padded(SLOT_DESCRIPTION),
        manufacturerID: space_padded(MANUFACTURER),
        flags: CKF_TOKEN_PRESENT,
        hardwareVersion: NULL_VERSION,
        firmwareVersion: NULL_VERSION,
    }
}

/// Token metadata. The token holds exactly one session-less RSA key, so the
/// counters describe a device with nothing to count.
pub fn token_info() -> CK_TOKEN_INFO {
    CK_TOKEN_INFO {
        label: space_padded(TOKEN_LABEL),
        manufacturerID: space_padded(MANUFACTURER),
        model: space_padded(TOKEN_MODEL),
        serialNumber: space_padded(TOKEN_SERIAL),
        flags: CKF_TOKEN_INITIALIZED,
        ulMaxSessionCount: 1,
        ulSessionCount: 0,
        ulMaxRwSessionCount: 1,
        ulRwSessionCount: 0,
        ulMaxPinLen: 64,
        ulMinPinLen: 8,
        ulTotalPublicMemory: 8,
        ulFreePublicMemory: 8,
        ulTotalPrivateMemory: 8,
        ulFreePrivateMemory: 8,
        hardwareVersion: NULL_VERSION,
        firmwareVersion: NULL_VERSION,
        utcTime: space_padded(""),
    }
}

/// Session metadata; the token only has read-only user sessions.
pub fn session_info() -> CK_SESSION_INFO {
    CK_SESSION_INFO {
        slotID: 0,
        state: CKS_RO_USER_FUNCTIONS,
        flags: CKF_SERIAL_SESSION,
        ulDeviceError: 0,
    }
}
