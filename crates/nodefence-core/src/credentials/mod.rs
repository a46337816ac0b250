//! Credential material for management endpoints.
//!
//! Passwords may be written to the configuration in plain form or base64
//! encoded (so they do not sit in cleartext in a file that is routinely
//! copied between cluster nodes). Decoding happens once, up front, and a
//! failure is a configuration error: no backend call is made with credentials
//! that did not decode.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

/// Credential settings as written in the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    /// Account name.
    #[serde(default)]
    pub username: String,

    /// Cleartext password.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,

    /// Standard-alphabet base64 encoding of the password.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password_base64: Option<SecretString>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

/// Decoded, ready-to-use credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Decoded password.
    pub password: SecretString,
}

impl CredentialConfig {
    /// Returns true when no credential material is configured at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_none() && self.password_base64.is_none()
    }

    /// Decodes the configured password.
    ///
    /// # Errors
    ///
    /// Returns an error if the username is empty, if neither or both password
    /// forms are set, or if the encoded form is not valid base64 of a UTF-8
    /// string.
    pub fn decode(&self) -> Result<Credentials, CredentialError> {
        if self.username.trim().is_empty() {
            return Err(CredentialError::MissingUsername);
        }

        let password = match (&self.password, &self.password_base64) {
            (Some(_), Some(_)) => return Err(CredentialError::AmbiguousPassword),
            (None, None) => return Err(CredentialError::MissingPassword),
            (Some(plain), None) => plain.clone(),
            (None, Some(encoded)) => decode_base64(encoded)?,
        };

        Ok(Credentials {
            username: self.username.clone(),
            password,
        })
    }
}

fn decode_base64(encoded: &SecretString) -> Result<SecretString, CredentialError> {
    let bytes = STANDARD
        .decode(encoded.expose_secret().trim())
        .map_err(|e| CredentialError::Base64(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|_| CredentialError::NotUtf8)?;
    Ok(SecretString::from(text))
}

/// Errors decoding configured credentials.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    /// Username is empty.
    #[error("username is not configured")]
    MissingUsername,

    /// Neither `password` nor `password_base64` is set.
    #[error("password is not configured")]
    MissingPassword,

    /// Both `password` and `password_base64` are set.
    #[error("both password and password_base64 are set")]
    AmbiguousPassword,

    /// `password_base64` is not valid base64.
    #[error("password_base64 is not valid base64: {0}")]
    Base64(String),

    /// `password_base64` decodes to bytes that are not UTF-8.
    #[error("password_base64 does not decode to UTF-8 text")]
    NotUtf8,
}
