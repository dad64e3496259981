//! The token's single key object and the shared output-buffer protocol.

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_OBJECT_CLASS, CK_ULONG, CKA_CLASS, CKA_DECRYPT, CKA_ID, CKA_LABEL,
    CKA_MODULUS, CKA_PUBLIC_EXPONENT, CKA_SIGN, CKO_PRIVATE_KEY,
};
use tracing::debug;

use crate::error::TokenError;
use crate::pubkey::RsaPublicKey;
use crate::token;

/// Two-phase output contract shared by every variable-length answer.
///
/// A null destination is a length query. A destination that is too small
/// gets the required length recorded and no payload bytes; otherwise the
/// payload is copied and the actual length recorded. Partial payloads are
/// never written.
///
/// # Safety
///
/// When `dest` is non-null it must point to at least `*len` writable bytes.
pub unsafe fn write_back(
    dest: *mut u8,
    len: &mut CK_ULONG,
    payload: &[u8],
) -> Result<(), TokenError> {
    let required = payload.len() as CK_ULONG;
    if dest.is_null() {
        *len = required;
        return Ok(());
    }
    if *len < required {
        *len = required;
        return Err(TokenError::BufferTooSmall);
    }
    unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), dest, payload.len()) };
    *len = required;
    Ok(())
}

/// Answer one attribute query against the key object.
///
/// Unsupported attribute types report length zero and succeed, which is how
/// callers probe what the token offers. Only an undersized caller buffer is
/// an error.
///
/// # Safety
///
/// When `attr.pValue` is non-null it must point to `attr.ulValueLen`
/// writable bytes.
pub unsafe fn resolve_attribute(
    attr: &mut CK_ATTRIBUTE,
    key: &RsaPublicKey,
    decrypt_capable: bool,
) -> Result<(), TokenError> {
    let dest = attr.pValue as *mut u8;
    let len = &mut attr.ulValueLen;
    match attr.type_ {
        CKA_ID | CKA_LABEL => unsafe { write_back(dest, len, &token::KEY_ID) },
        CKA_CLASS => {
            let class: CK_OBJECT_CLASS = CKO_PRIVATE_KEY;
            unsafe { write_back(dest, len, &class.to_ne_bytes()) }
        }
        CKA_SIGN => unsafe { write_back(dest, len, &[1u8]) },
        CKA_DECRYPT => unsafe { write_back(dest, len, &[u8::from(decrypt_capable)]) },
        CKA_PUBLIC_EXPONENT => unsafe { write_back(dest, len, &key.exponent.to_be_bytes()) },
        CKA_MODULUS => unsafe { write_back(dest, len, &key.modulus) },
        other => {
            debug!(attribute = other, "unsupported attribute");
            attr.ulValueLen = 0;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use cryptoki_sys::{CK_ATTRIBUTE_TYPE, CKA_VALUE};

    use super::*;

    fn key() -> RsaPublicKey {
        RsaPublicKey {
            modulus: vec![0xAB; 256],
            key_bits: 2048,
            exponent: 65537,
        }
    }

    fn attr_with(type_: CK_ATTRIBUTE_TYPE, buf: &mut [u8]) -> CK_ATTRIBUTE {
        CK_ATTRIBUTE {
            type_,
            pValue: buf.as_mut_ptr().cast(),
            ulValueLen: buf.len() as CK_ULONG,
        }
    }

    fn attr_length_query(type_: CK_ATTRIBUTE_TYPE) -> CK_ATTRIBUTE {
        CK_ATTRIBUTE {
            type_,
            pValue: std::ptr::null_mut(),
            ulValueLen: 0,
        }
    }

    #[test]
    fn write_back_answers_length_queries() {
        let mut len: CK_ULONG = 0;
        unsafe { write_back(std::ptr::null_mut(), &mut len, b"payload") }.expect("length query");
        assert_eq!(len, 7);
    }

    #[test]
    fn write_back_copies_into_exact_and_oversized_buffers() {
        let mut exact = [0u8; 7];
        let mut len = exact.len() as CK_ULONG;
        unsafe { write_back(exact.as_mut_ptr(), &mut len, b"payload") }.expect("exact fit");
        assert_eq!(&exact, b"payload");
        assert_eq!(len, 7);

        let mut oversized = [0u8; 16];
        let mut len = oversized.len() as CK_ULONG;
        unsafe { write_back(oversized.as_mut_ptr(), &mut len, b"payload") }.expect("oversized");
        assert_eq!(&oversized[..7], b"payload");
        assert_eq!(len, 7, "length reports the payload, not the capacity");
    }

    #[test]
    fn write_back_rejects_undersized_buffers_without_writing() {
        let mut small = [0u8; 3];
        let mut len = small.len() as CK_ULONG;
        let err = unsafe { write_back(small.as_mut_ptr(), &mut len, b"payload") }
            .expect_err("undersized");
        assert!(matches!(err, TokenError::BufferTooSmall));
        assert_eq!(len, 7, "required length is still reported");
        assert_eq!(small, [0u8; 3], "no partial payload");
    }

    #[test]
    fn id_and_label_share_the_fixed_identity() {
        for type_ in [CKA_ID, CKA_LABEL] {
            let mut buf = [0u8; 8];
            let mut attr = attr_with(type_, &mut buf);
            unsafe { resolve_attribute(&mut attr, &key(), true) }.expect("identity");
            assert_eq!(attr.ulValueLen, 8);
            assert_eq!(&buf, b"tpm2-key");
        }
    }

    #[test]
    fn class_is_the_private_key_tag() {
        let mut buf = [0u8; size_of::<CK_OBJECT_CLASS>()];
        let mut attr = attr_with(CKA_CLASS, &mut buf);
        unsafe { resolve_attribute(&mut attr, &key(), true) }.expect("class");
        assert_eq!(buf, CKO_PRIVATE_KEY.to_ne_bytes());
    }

    #[test]
    fn capabilities_track_the_key_source() {
        let mut buf = [0u8; 1];
        let mut attr = attr_with(CKA_SIGN, &mut buf);
        unsafe { resolve_attribute(&mut attr, &key(), false) }.expect("sign");
        assert_eq!(buf, [1], "signing is always advertised");

        let mut attr = attr_with(CKA_DECRYPT, &mut buf);
        unsafe { resolve_attribute(&mut attr, &key(), true) }.expect("decrypt, device");
        assert_eq!(buf, [1]);

        let mut attr = attr_with(CKA_DECRYPT, &mut buf);
        unsafe { resolve_attribute(&mut attr, &key(), false) }.expect("decrypt, file");
        assert_eq!(buf, [0], "file-resident material cannot decrypt");
    }

    #[test]
    fn exponent_is_big_endian_four_bytes() {
        let mut buf = [0u8; 4];
        let mut attr = attr_with(CKA_PUBLIC_EXPONENT, &mut buf);
        unsafe { resolve_attribute(&mut attr, &key(), true) }.expect("exponent");
        assert_eq!(buf, [0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn modulus_is_served_whole() {
        let mut attr = attr_length_query(CKA_MODULUS);
        unsafe { resolve_attribute(&mut attr, &key(), true) }.expect("length");
        assert_eq!(attr.ulValueLen, 256);

        let mut buf = vec![0u8; 256];
        let mut attr = attr_with(CKA_MODULUS, &mut buf);
        unsafe { resolve_attribute(&mut attr, &key(), true) }.expect("fetch");
        assert_eq!(buf, vec![0xAB; 256]);
    }

    #[test]
    fn unsupported_attributes_report_zero_length() {
        let mut buf = [0xFFu8; 4];
        let mut attr = attr_with(CKA_VALUE, &mut buf);
        unsafe { resolve_attribute(&mut attr, &key(), true) }.expect("unsupported");
        assert_eq!(attr.ulValueLen, 0);
        assert_eq!(buf, [0xFF; 4], "buffer is untouched");
    }
}
