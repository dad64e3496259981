//! Parsed RSA public material for the attribute table.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;
use tss_esapi::structures::Public;
use tss_esapi::traits::UnMarshall;

use crate::config::{Config, KeySource};
use crate::error::TokenError;
use crate::tpm::TpmKey;

/// Default RSA public exponent; devices report it as zero.
const DEFAULT_EXPONENT: u32 = 65537;

/// The public half of the token's key, in the form the attribute table
/// serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    /// Raw big-endian modulus, exactly `key_bits / 8` bytes.
    pub modulus: Vec<u8>,
    /// Key size in bits.
    pub key_bits: u16,
    /// Public exponent with the zero placeholder already normalized.
    pub exponent: u32,
}

impl RsaPublicKey {
    /// Obtain the view from whatever source the configuration names.
    pub fn read(config: &Config) -> Result<Self, TokenError> {
        match config.key_source() {
            KeySource::File(path) => Self::from_descriptor_file(path),
            KeySource::Device(_) => {
                let public = TpmKey::connect(config)?.read_public()?;
                Self::from_public(&public)
            }
        }
    }

    /// Convert a device public area, accepting only the RSA variant.
    pub fn from_public(public: &Public) -> Result<Self, TokenError> {
        match public {
            Public::Rsa {
                parameters, unique, ..
            } => {
                let key_bits = u16::from(parameters.key_bits());
                let exponent = match parameters.exponent().value() {
                    0 => DEFAULT_EXPONENT,
                    exponent => exponent,
                };
                let modulus = unique.value().to_vec();
                if modulus.len() != usize::from(key_bits / 8) {
                    return Err(TokenError::PublicArea(format!(
                        "modulus is {} bytes for a {key_bits} bit key",
                        modulus.len()
                    )));
                }
                Ok(Self {
                    modulus,
                    key_bits,
                    exponent,
                })
            }
            _ => Err(TokenError::PublicArea("only rsa keys are supported".into())),
        }
    }

    /// Unmarshall the public area from a descriptor file.
    ///
    /// The mapping is read-only and must not outlive the call; everything
    /// the view needs is copied out before it drops.
    fn from_descriptor_file(path: &Path) -> Result<Self, TokenError> {
        let key_file_error = |reason: String| TokenError::KeyFile {
            path: path.to_owned(),
            reason,
        };
        let file = File::open(path).map_err(|err| key_file_error(err.to_string()))?;
        let length = file
            .metadata()
            .map_err(|err| key_file_error(err.to_string()))?
            .len();
        if length == 0 {
            return Err(key_file_error("file is empty".into()));
        }
        // The map is only valid while the descriptor file is left alone.
        let map = unsafe { Mmap::map(&file) }.map_err(|err| key_file_error(err.to_string()))?;
        let public = Public::unmarshall(&map).map_err(|err| {
            TokenError::PublicArea(format!("cannot unmarshall {}: {err}", path.display()))
        })?;
        debug!(path = %path.display(), length, "key descriptor loaded");
        Self::from_public(&public)
    }
}

/// Builds an RSA public area without touching a device, shaped like the
/// templates real keys are created from.
#[cfg(test)]
pub(crate) fn test_rsa_public(
    key_bits: u16,
    exponent: tss_esapi::structures::RsaExponent,
    modulus: Vec<u8>,
) -> Public {
    use tss_esapi::attributes::ObjectAttributesBuilder;
    use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
    use tss_esapi::interface_types::key_bits::RsaKeyBits;
    use tss_esapi::structures::{
        PublicBuilder, PublicKeyRsa, PublicRsaParametersBuilder, RsaScheme,
        SymmetricDefinitionObject,
    };

    let parameters = PublicRsaParametersBuilder::new()
        .with_scheme(RsaScheme::Null)
        .with_key_bits(RsaKeyBits::try_from(key_bits).expect("key bits"))
        .with_exponent(exponent)
        .with_symmetric(SymmetricDefinitionObject::Null)
        .with_is_signing_key(false)
        .with_is_decryption_key(true)
        .with_restricted(false)
        .build()
        .expect("rsa parameters");
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .build()
        .expect("object attributes");
    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_rsa_parameters(parameters)
        .with_rsa_unique_identifier(PublicKeyRsa::try_from(modulus).expect("modulus"))
        .build()
        .expect("public area")
}
