use data_encoding::BASE64;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{AuthError, CredentialService, MESSAGE2_LEN};
use crate::codec::bdc::{IDENTIFY_BLINK, uuids};
use crate::coordinator::Connection;
use crate::events::NodeEvent;
use crate::link::constants::{GATT_INSUFFICIENT_AUTHENTICATION, SERVICE_CHANGED_UUID};
use crate::operation::{
    AbortReliableWrite, Disconnect, DiscoverServices, EnableIndication, GattErrorKind,
    OperationError, WriteAwaitIndication, WriteCharacteristic,
};

/// Run the four-message handshake on a connected link. Any failure
/// disconnects, so no half-authenticated link is left behind.
#[instrument(skip_all, fields(device = %device_id))]
pub(crate) async fn authenticate(
    conn: &Connection,
    device_id: Uuid,
    service: &dyn CredentialService,
) -> Result<(), OperationError> {
    match exchange(conn, device_id, service).await {
        Ok(()) => {
            info!("Authenticated");
            conn.notify(&NodeEvent::Authenticated { device: device_id });
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Authentication failed");
            if let Err(d) = conn.perform(Disconnect).await {
                debug!(error = %d, "Disconnect after failed authentication");
            }
            Err(e)
        }
    }
}

async fn exchange(
    conn: &Connection,
    device_id: Uuid,
    service: &dyn CredentialService,
) -> Result<(), OperationError> {
    let challenge = service
        .initiate_auth(device_id)
        .await
        .map_err(AuthError::from)?;

    // Pre-authentication
    conn.perform(AbortReliableWrite).await?;
    conn.perform(DiscoverServices).await?;
    conn.perform(EnableIndication::indication(uuids::AUTH)).await?;
    conn.perform(EnableIndication::indication(SERVICE_CHANGED_UUID))
        .await?;

    let message2 = conn
        .perform(WriteAwaitIndication::new(uuids::AUTH, challenge.message1))
        .await?;
    if message2.len() != MESSAGE2_LEN {
        return Err(AuthError::MalformedMessage2 {
            len: message2.len(),
        }
        .into());
    }
    debug!("Challenge answered");

    let token = service
        .request_token(device_id, &challenge.context, &BASE64.encode(&message2))
        .await
        .map_err(AuthError::from)?;

    let verdict = conn
        .perform(WriteAwaitIndication::new(uuids::AUTH, token.token))
        .await?;
    if !verdict.is_empty() {
        return Err(OperationError::gatt(
            GattErrorKind::Gatt(GATT_INSUFFICIENT_AUTHENTICATION),
            "auth:token",
        ));
    }

    // Authenticated services only show up after a fresh discovery.
    conn.refresh().await?;
    tokio::time::sleep(conn.config().auth_settle()).await;
    conn.perform(DiscoverServices).await?;
    conn.perform(WriteCharacteristic::unverified(
        uuids::IDENTIFY,
        vec![IDENTIFY_BLINK],
    ))
    .await
}
