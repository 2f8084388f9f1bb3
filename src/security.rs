//! Credentials carried by hook requests.
//!
//! The hook subprocess only ever sees the shared secret in its at-rest
//! encoding. The server decodes it with a [`SecretCodec`] and logs the caller
//! in through an [`Authenticator`]. Every login is independent, so each
//! connection authenticates as a fresh subject.

use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("encoded secret is malformed")]
    MalformedSecret,

    #[error("hook actor is empty")]
    MissingActor,

    #[error("invalid credentials for actor `{actor}`")]
    InvalidCredentials { actor: String },
}

pub trait SecretCodec: Send + Sync {
    fn encode(&self, secret: &SecretString) -> String;

    fn decode(&self, encoded: &str) -> Result<SecretString, AuthError>;
}

/// Hex at-rest encoding of the shared secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexSecretCodec;

impl SecretCodec for HexSecretCodec {
    fn encode(&self, secret: &SecretString) -> String {
        hex::encode(secret.expose_secret().as_bytes())
    }

    fn decode(&self, encoded: &str) -> Result<SecretString, AuthError> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| AuthError::MalformedSecret)?;
        let text = String::from_utf8(bytes).map_err(|_| AuthError::MalformedSecret)?;
        Ok(SecretString::from(text))
    }
}

#[derive(Debug)]
pub struct AuthenticationToken {
    pub actor: String,
    pub secret: SecretString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

pub trait Authenticator: Send + Sync {
    fn login(&self, token: &AuthenticationToken) -> Result<Principal, AuthError>;
}

/// Accepts any non-empty actor that presents the configured shared secret.
pub struct SharedSecretAuthenticator {
    secret: SecretString,
}

impl SharedSecretAuthenticator {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }
}

impl Authenticator for SharedSecretAuthenticator {
    fn login(&self, token: &AuthenticationToken) -> Result<Principal, AuthError> {
        if token.actor.trim().is_empty() {
            return Err(AuthError::MissingActor);
        }
        let presented = token.secret.expose_secret().as_bytes();
        if !constant_time_eq(presented, self.secret.expose_secret().as_bytes()) {
            return Err(AuthError::InvalidCredentials {
                actor: token.actor.clone(),
            });
        }
        Ok(Principal {
            name: token.actor.clone(),
        })
    }
}

/// 32 bytes from the OS RNG, hex encoded.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
