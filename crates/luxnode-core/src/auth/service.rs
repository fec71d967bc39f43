//! Credential service boundary.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use data_encoding::{BASE64, BASE64URL_NOPAD};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::{MESSAGE2_LEN, NONCE_LEN, access_key, challenge_hash, token};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Device not found")]
    NotFound,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("{0}")]
    Other(String),
}

/// First half of a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// `RA || NA`, written to the node as is.
    pub message1: Vec<u8>,
    /// Opaque session binding, handed back with the token request.
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: Vec<u8>,
}

/// Holder of the device keys.
#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn initiate_auth(&self, device_id: Uuid) -> Result<AuthChallenge, ServiceError>;

    /// `message2_b64` is the node's answer, standard padded base64.
    async fn request_token(
        &self,
        device_id: Uuid,
        context: &str,
        message2_b64: &str,
    ) -> Result<AuthToken, ServiceError>;
}

/// Sessions older than this are refused.
const CONTEXT_TTL_SECS: u64 = 300;

/// In-process credential service backed by a table of device keys.
///
/// The context string is `id.timestamp.base64url(RA || NA)`, so the service
/// keeps no per-session state.
#[derive(Debug, Default)]
pub struct LocalCredentialService {
    keys: Mutex<HashMap<Uuid, [u8; 16]>>,
}

impl LocalCredentialService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, device_id: Uuid, device_key: [u8; 16]) -> Self {
        self.insert(device_id, device_key);
        self
    }

    pub fn insert(&self, device_id: Uuid, device_key: [u8; 16]) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id, device_key);
    }

    fn key(&self, device_id: Uuid) -> Result<[u8; 16], ServiceError> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device_id)
            .copied()
            .ok_or(ServiceError::NotFound)
    }

    fn now() -> Result<u64, ServiceError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|e| ServiceError::ServerError(e.to_string()))
    }

    /// Split a context into its device id, timestamp and `RA || NA`.
    fn parse_context(context: &str) -> Result<(Uuid, u64, Vec<u8>), ServiceError> {
        let bad = || ServiceError::BadRequest("malformed context".into());
        let mut parts = context.split('.');
        let (Some(id), Some(issued), Some(nonces), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        let id = Uuid::parse_str(id).map_err(|_| bad())?;
        let issued = issued.parse().map_err(|_| bad())?;
        let nonces = BASE64URL_NOPAD.decode(nonces.as_bytes()).map_err(|_| bad())?;
        if nonces.len() != 2 * NONCE_LEN {
            return Err(bad());
        }
        Ok((id, issued, nonces))
    }
}

#[async_trait]
impl CredentialService for LocalCredentialService {
    async fn initiate_auth(&self, device_id: Uuid) -> Result<AuthChallenge, ServiceError> {
        self.key(device_id)?;
        let ra: [u8; NONCE_LEN] = rand::random();
        let na: [u8; NONCE_LEN] = rand::random();
        let message1 = [ra, na].concat();
        let context = format!(
            "{device_id}.{}.{}",
            Self::now()?,
            BASE64URL_NOPAD.encode(&message1)
        );
        Ok(AuthChallenge { message1, context })
    }

    async fn request_token(
        &self,
        device_id: Uuid,
        context: &str,
        message2_b64: &str,
    ) -> Result<AuthToken, ServiceError> {
        let (bound, issued, nonces) = Self::parse_context(context)?;
        if bound != device_id {
            return Err(ServiceError::Forbidden("context bound to another device".into()));
        }
        if Self::now()?.saturating_sub(issued) > CONTEXT_TTL_SECS {
            return Err(ServiceError::Forbidden("context expired".into()));
        }

        let message2 = BASE64
            .decode(message2_b64.as_bytes())
            .map_err(|e| ServiceError::BadRequest(e.to_string()))?;
        if message2.len() != MESSAGE2_LEN {
            return Err(ServiceError::BadRequest(format!(
                "challenge response is {} bytes",
                message2.len()
            )));
        }

        let key = access_key(&self.key(device_id)?, device_id);
        let (ra, na) = nonces.split_at(NONCE_LEN);
        let (rb, rest) = message2.split_at(NONCE_LEN);
        let (nb, hash) = rest.split_at(NONCE_LEN);
        if challenge_hash(&key, device_id, ra, na, rb, nb) != hash {
            debug!(%device_id, "Challenge hash mismatch");
            return Err(ServiceError::Unauthorized);
        }
        Ok(AuthToken {
            token: token(&key, ra, rb).to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: Uuid = Uuid::from_u128(0xB0);
    const KEY: [u8; 16] = [0x42; 16];

    /// What a node answers to `message1`.
    fn answer(message1: &[u8]) -> (Vec<u8>, [u8; 16], [u8; 16]) {
        let key = access_key(&KEY, DEVICE);
        let (ra, na) = message1.split_at(NONCE_LEN);
        let (rb, nb) = ([0x11; 16], [0x22; 16]);
        let hash = challenge_hash(&key, DEVICE, ra, na, &rb, &nb);
        ([rb.as_slice(), &nb, &hash].concat(), rb, hash)
    }

    #[tokio::test]
    async fn test_token_for_valid_answer() {
        let service = LocalCredentialService::new().with_device(DEVICE, KEY);
        let challenge = service.initiate_auth(DEVICE).await.unwrap();
        assert_eq!(challenge.message1.len(), 32);

        let (message2, rb, _) = answer(&challenge.message1);
        let token = service
            .request_token(DEVICE, &challenge.context, &BASE64.encode(&message2))
            .await
            .unwrap();

        let key = access_key(&KEY, DEVICE);
        assert_eq!(token.token, super::token(&key, &challenge.message1[..16], &rb).to_vec());
    }

    #[tokio::test]
    async fn test_rejections() {
        let service = LocalCredentialService::new().with_device(DEVICE, KEY);
        assert_eq!(
            service.initiate_auth(Uuid::nil()).await,
            Err(ServiceError::NotFound)
        );

        let challenge = service.initiate_auth(DEVICE).await.unwrap();
        let (mut message2, _, _) = answer(&challenge.message1);
        let encoded = BASE64.encode(&message2);

        assert!(matches!(
            service
                .request_token(Uuid::nil(), &challenge.context, &encoded)
                .await,
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            service.request_token(DEVICE, "garbage", &encoded).await,
            Err(ServiceError::BadRequest(_))
        ));
        assert!(matches!(
            service
                .request_token(DEVICE, &challenge.context, &BASE64.encode(&message2[..40]))
                .await,
            Err(ServiceError::BadRequest(_))
        ));

        message2[47] ^= 1;
        assert_eq!(
            service
                .request_token(DEVICE, &challenge.context, &BASE64.encode(&message2))
                .await,
            Err(ServiceError::Unauthorized)
        );
    }
}
