//! Device bridge: the three primitives the token delegates to the TPM.

use std::str::FromStr;

use tracing::debug;
use tss_esapi::Context;
use tss_esapi::constants::tss::{TPM2_RH_NULL, TPM2_ST_HASHCHECK};
use tss_esapi::handles::{KeyHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::structures::{
    Data, Digest, HashScheme, HashcheckTicket, Public, PublicKeyRsa, RsaDecryptionScheme,
    Signature, SignatureScheme,
};
use tss_esapi::tcti_ldr::{NetworkTPMConfig, TctiNameConf};
use tss_esapi::tss2_esys::{TPM2B_DIGEST, TPMT_TK_HASHCHECK};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::error::TokenError;

/// Default port of the simulator transport.
const DEFAULT_SIMULATOR_PORT: u16 = 2321;

/// Transport selection: a configured hostname picks the simulator TCP
/// transport, otherwise the environment TCTI, otherwise the local device.
fn tcti_from_config(config: &Config) -> Result<TctiNameConf, TokenError> {
    match &config.hostname {
        Some(hostname) => {
            let port = match config.port {
                0 => DEFAULT_SIMULATOR_PORT,
                port => port,
            };
            let network = NetworkTPMConfig::from_str(&format!("host={hostname},port={port}"))?;
            Ok(TctiNameConf::Mssim(network))
        }
        None => Ok(TctiNameConf::from_environment_variable()
            .unwrap_or(TctiNameConf::Device(Default::default()))),
    }
}

/// A connected device context with the configured key already resolved.
///
/// Contexts are cheap relative to the asymmetric operations behind them and
/// are not shareable across threads, so every call builds a fresh one on the
/// caller's thread.
pub struct TpmKey {
    ctx: Context,
    key: KeyHandle,
}

impl TpmKey {
    /// Connect to the device named by the configuration and resolve its
    /// persistent key handle into an object handle.
    pub fn connect(config: &Config) -> Result<Self, TokenError> {
        debug!(
            hostname = ?config.hostname,
            port = config.port,
            "connecting to device for key {:#010x}",
            config.key_handle
        );
        let tcti = tcti_from_config(config)?;
        let mut ctx = Context::new(tcti)?;
        let tpm_handle = TpmHandle::try_from(config.key_handle)?;
        let object = ctx.execute_without_session(|ctx| ctx.tr_from_tpm_public(tpm_handle))?;
        Ok(Self {
            ctx,
            key: KeyHandle::from(object.value()),
        })
    }

    /// Fetch the key's public area from the device.
    pub fn read_public(&mut self) -> Result<Public, TokenError> {
        let key = self.key;
        let (public, _name, _qualified_name) = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.read_public(key))?;
        Ok(public)
    }

    /// RSASSA PKCS#1 v1.5 signature over a caller-supplied digest.
    pub fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let key = self.key;
        let digest = Digest::try_from(data)?;
        let scheme = SignatureScheme::RsaSsa {
            hash_scheme: HashScheme::new(HashingAlgorithm::Sha256),
        };
        // The digest was produced off-device, so the ticket is the null ticket.
        let validation = HashcheckTicket::try_from(TPMT_TK_HASHCHECK {
            tag: TPM2_ST_HASHCHECK,
            hierarchy: TPM2_RH_NULL,
            digest: TPM2B_DIGEST {
                size: 0,
                buffer: [0; 64],
            },
        })?;
        let signature = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.sign(key, digest, scheme, validation))?;
        match signature {
            Signature::RsaSsa(rsa) => Ok(rsa.signature().value().to_vec()),
            other => {
                debug!(?other, "device produced a non-RSASSA signature");
                Err(TokenError::SignatureType)
            }
        }
    }

    /// RSAES PKCS#1 v1.5 decryption. The plaintext is wiped on drop.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, TokenError> {
        let key = self.key;
        let ciphertext = PublicKeyRsa::try_from(ciphertext.to_vec())?;
        let plaintext = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.rsa_decrypt(key, ciphertext, RsaDecryptionScheme::RsaEs, Data::default())
        })?;
        Ok(Zeroizing::new(plaintext.value().to_vec()))
    }
}
