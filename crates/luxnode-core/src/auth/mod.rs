//! Mutual authentication for Bdc nodes.
//!
//! The central and an external credential service share the per-device key;
//! the node proves knowledge of the derived access key with `HASH` and the
//! service answers with a token the node checks in turn:
//!
//! ```text
//! central -> node    message1 = RA || NA
//! node    -> central message2 = RB || NB || CMAC(K, RA || RB || id || NA || NB)
//! central -> node    token    = CMAC(K, RB || RA)
//! node    -> central empty indication on success
//! ```

pub mod crypto;
mod handshake;
pub mod service;

pub use crypto::{aes128_cmac, aes256_cmac, derive_access_key};
pub(crate) use handshake::authenticate;
pub use service::{AuthChallenge, AuthToken, CredentialService, LocalCredentialService, ServiceError};

use thiserror::Error;
use uuid::Uuid;

/// KDF label for the access key. The context is the device id.
pub const ACCESS_KEY_LABEL: &[u8] = b"luxnode-access";

pub const NONCE_LEN: usize = 16;
pub const MESSAGE1_LEN: usize = 2 * NONCE_LEN;
pub const MESSAGE2_LEN: usize = 3 * NONCE_LEN;
pub const TOKEN_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No credential service configured")]
    NoCredentials,

    #[error("Credential service: {0}")]
    Service(#[from] ServiceError),

    #[error("Malformed challenge response: {len} bytes")]
    MalformedMessage2 { len: usize },
}

/// 256-bit access key of one device.
pub fn access_key(device_key: &[u8; 16], device_id: Uuid) -> [u8; 32] {
    derive_access_key(device_key, ACCESS_KEY_LABEL, device_id.as_bytes())
}

/// `HASH` carried at the end of message2.
pub fn challenge_hash(
    access_key: &[u8; 32],
    device_id: Uuid,
    ra: &[u8],
    na: &[u8],
    rb: &[u8],
    nb: &[u8],
) -> [u8; 16] {
    let mut input = Vec::with_capacity(4 * NONCE_LEN + 16);
    input.extend_from_slice(ra);
    input.extend_from_slice(rb);
    input.extend_from_slice(device_id.as_bytes());
    input.extend_from_slice(na);
    input.extend_from_slice(nb);
    aes256_cmac(access_key, &input)
}

pub fn token(access_key: &[u8; 32], ra: &[u8], rb: &[u8]) -> [u8; 16] {
    let mut input = Vec::with_capacity(2 * NONCE_LEN);
    input.extend_from_slice(rb);
    input.extend_from_slice(ra);
    aes256_cmac(access_key, &input)
}
