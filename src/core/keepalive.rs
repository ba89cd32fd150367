//! Keepalive engine: periodic outbound pings.
//!
//! Each tick enqueues a `ping_pong` at control priority with an
//! enqueue-to-write deadline; the writer accounts for misses and write
//! timeouts, and that escalation is the only graceful path by which the brain
//! initiates a close under stress. Inbound ping echo lives in the machine's
//! dispatch; the idle watchdog lives in the machine's run loop.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::protocol::OutboundEvent;
use super::transport::{OutboundEnvelope, OutboundQueue};

/// Wall-clock milliseconds for wire timestamps.
pub fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Spawn the heartbeat loop. Runs until the session token fires.
pub fn spawn_ping_loop(
    outbound_q: OutboundQueue,
    interval_ms: u64,
    write_deadline_ms: u64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(interval_ms.max(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("ping loop stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            let env = OutboundEnvelope::new(
                OutboundEvent::PingPong {
                    timestamp: unix_ms(),
                },
                None,
                None,
            )
            .with_deadline_ms(write_deadline_ms);
            // Heartbeats ride the control plane; a full queue of speech must
            // not keep them out.
            if !outbound_q.try_push(env) {
                debug!("outbound queue refused a heartbeat");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::BoundedQueue;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ping_loop_enqueues_on_interval_and_stops_on_cancel() {
        let q: OutboundQueue = Arc::new(BoundedQueue::new(8));
        let token = CancellationToken::new();
        let handle = spawn_ping_loop(q.clone(), 200, 100, token.clone());

        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(q.len(), 3);
        let env = q.pop().await.unwrap();
        assert!(env.msg.is_ping());
        assert_eq!(env.deadline_ms, Some(100));

        token.cancel();
        handle.await.unwrap();
        let len_after_cancel = q.len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(q.len(), len_after_cancel);
    }
}
