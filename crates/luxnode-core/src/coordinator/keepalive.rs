//! Periodic diagnostics read that keeps the link warm.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::Context;
use super::connection::Connection;
use crate::codec::FamilyCodec;

/// Spawn the heartbeat. The first tick fires one interval from now.
///
/// A failed or timed-out read clears the pending slot so a stuck operation
/// cannot wedge the link; the link itself is left alone.
pub(crate) fn spawn(
    conn: Arc<Connection>,
    codec: Arc<dyn FamilyCodec>,
    ctx: Arc<Context>,
) -> JoinHandle<()> {
    let period = ctx.config.keepalive_interval();
    let limit = ctx.config.keepalive_timeout();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match tokio::time::timeout(limit, codec.read_diagnostics(&conn)).await {
                Ok(Ok(Some(diagnostics))) => {
                    debug!(status = diagnostics.status, "Keep-alive");
                    ctx.state.send_modify(|s| {
                        let merged = match s.characteristics.diagnostics.take() {
                            Some(prev) => crate::model::Diagnostics {
                                health: diagnostics.health.or(prev.health),
                                state: diagnostics.state.or(prev.state),
                                ..diagnostics
                            },
                            None => diagnostics,
                        };
                        s.characteristics.diagnostics = Some(merged);
                    });
                }
                Ok(Ok(None)) => debug!("Keep-alive"),
                Ok(Err(e)) => {
                    warn!(error = %e, "Keep-alive read failed");
                    conn.reset_pending();
                }
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Keep-alive read timed out");
                    conn.reset_pending();
                }
            }
        }
    })
}
