//! Operation error taxonomy.

use thiserror::Error;

use crate::auth::AuthError;
use crate::link::TransportError;

/// What went wrong with an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattErrorKind {
    /// The remote side answered with a non-success status.
    #[error("GATT status 0x{0:02X}")]
    Gatt(u8),

    /// The local link refused to issue the request.
    #[error("Link rejected the request")]
    MethodFailed,

    /// Required service or characteristic missing, usually a stale cache.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Written value not confirmed by read-back")]
    WriteValueMismatch,

    #[error("Link permission not granted")]
    MissingPermission,
}

impl From<TransportError> for GattErrorKind {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PermissionDenied => GattErrorKind::MissingPermission,
            TransportError::UnknownCharacteristic(uuid) => {
                GattErrorKind::PreconditionFailed(format!("characteristic {uuid} not discovered"))
            }
            other => {
                tracing::debug!(error = %other, "Link rejected request");
                GattErrorKind::MethodFailed
            }
        }
    }
}

/// Failed operation, tagged with the operation that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct GattError {
    pub kind: GattErrorKind,
    pub operation: Option<String>,
}

impl GattError {
    pub fn new(kind: GattErrorKind, operation: impl Into<String>) -> Self {
        Self {
            kind,
            operation: Some(operation.into()),
        }
    }

    pub fn untagged(kind: GattErrorKind) -> Self {
        Self {
            kind,
            operation: None,
        }
    }
}

impl std::fmt::Display for GattError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.operation {
            Some(op) => write!(f, "{} ({})", self.kind, op),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Outcome of an operation that did not produce data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error(transparent)]
    Gatt(#[from] GattError),

    /// Authentication handshake rejected by the node or the credential service.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Unexpected failure outside the protocol. Never retried.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl OperationError {
    pub fn gatt(kind: GattErrorKind, operation: impl Into<String>) -> Self {
        OperationError::Gatt(GattError::new(kind, operation))
    }

    pub fn kind(&self) -> Option<&GattErrorKind> {
        match self {
            OperationError::Gatt(e) => Some(&e.kind),
            OperationError::Auth(_) | OperationError::Fatal(_) => None,
        }
    }

    pub fn is_missing_permission(&self) -> bool {
        matches!(self.kind(), Some(GattErrorKind::MissingPermission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(
            GattErrorKind::from(TransportError::PermissionDenied),
            GattErrorKind::MissingPermission
        );
        assert_eq!(
            GattErrorKind::from(TransportError::NotConnected),
            GattErrorKind::MethodFailed
        );
        assert!(matches!(
            GattErrorKind::from(TransportError::UnknownCharacteristic(Uuid::nil())),
            GattErrorKind::PreconditionFailed(_)
        ));
    }

    #[test]
    fn test_error_display_carries_operation() {
        let err = GattError::new(GattErrorKind::Gatt(0x85), "read:mode");
        assert_eq!(err.to_string(), "GATT status 0x85 (read:mode)");
        assert_eq!(
            GattError::untagged(GattErrorKind::WriteValueMismatch).to_string(),
            "Written value not confirmed by read-back"
        );
    }
}
