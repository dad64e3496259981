//! Token configuration, loaded once at module initialization.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::TokenError;

/// Directory under `$HOME` holding the module configuration.
const CONFIG_DIR: &str = ".tpm2-token";
/// File name of the configuration inside [`CONFIG_DIR`].
const CONFIG_FILE: &str = "config";

/// Parsed module configuration.
///
/// One immutable snapshot is shared by every session for the lifetime of
/// the module instance; nothing mutates it after [`Config::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// TPM simulator host. `None` selects the environment TCTI, falling
    /// back to the local device.
    pub hostname: Option<String>,
    /// Simulator port; `0` selects the default.
    pub port: u16,
    /// Marshalled public-area file of the key, for file-resident material.
    pub key: Option<PathBuf>,
    /// Persistent handle of the key on the device.
    pub key_handle: u32,
}

/// Where the public key material for attribute queries comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource<'a> {
    /// Read the public area from the device at this persistent handle.
    Device(u32),
    /// Unmarshall the public area from this file.
    File(&'a Path),
}

impl Config {
    /// Load and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, TokenError> {
        let text = fs::read_to_string(path).map_err(|source| TokenError::Config {
            path: path.to_owned(),
            source,
        })?;
        let config = Self::parse(&text);
        debug!(path = %path.display(), ?config, "configuration loaded");
        Ok(config)
    }

    /// Load the configuration from the fixed per-user path,
    /// `$HOME/.tpm2-token/config`.
    pub fn load_default() -> Result<Self, TokenError> {
        let home = std::env::var_os("HOME").ok_or_else(|| TokenError::Config {
            path: PathBuf::from(CONFIG_DIR).join(CONFIG_FILE),
            source: io::Error::new(io::ErrorKind::NotFound, "HOME is not set"),
        })?;
        Self::load(&PathBuf::from(home).join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Parse `key value` lines.
    ///
    /// Unknown keys are ignored and malformed numeric values fall back to
    /// zero, so a stray line never aborts the load. The value is the
    /// remainder of the line, which keeps paths with spaces intact.
    fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.trim_start().split_once(char::is_whitespace) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key {
                "hostname" => config.hostname = Some(value.to_owned()),
                "port" => config.port = value.parse().unwrap_or(0),
                "key" => config.key = Some(PathBuf::from(value)),
                "key_handle" => {
                    config.key_handle = value
                        .strip_prefix("0x")
                        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                        .unwrap_or(0);
                }
                _ => {}
            }
        }
        config
    }

    /// The key-material source derived from the loaded fields. A configured
    /// descriptor file takes precedence over a device handle.
    pub fn key_source(&self) -> KeySource<'_> {
        match &self.key {
            Some(path) => KeySource::File(path),
            None => KeySource::Device(self.key_handle),
        }
    }
}
