//! Broadcast Relay
//!
//! Fans one message out to every registered connection except its origin.
//! The registry lock is only held while the snapshot is copied; sends run
//! afterwards, concurrently, each bounded by the write timeout.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::connection::{ConnectionId, ConnectionRegistry};

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipients the message was written to
    pub delivered: Vec<ConnectionId>,
    /// Recipients whose transport failed
    pub failed: Vec<ConnectionId>,
}

impl DeliveryReport {
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// Delivers messages to all connections but the sender
#[derive(Debug, Clone)]
pub struct BroadcastRelay {
    registry: Arc<ConnectionRegistry>,
    write_timeout: Duration,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Deliver `message` to every registered connection except `origin`.
    ///
    /// A failing recipient is logged and reported, never propagated: the
    /// remaining recipients still receive the message and the sender sees
    /// no error.
    pub async fn broadcast(&self, message: &str, origin: ConnectionId) -> DeliveryReport {
        let snapshot = self.registry.snapshot();

        let deliveries = snapshot.recipients(origin).map(|entry| async move {
            let result = entry.handle.send(message, self.write_timeout).await;
            (entry, result)
        });

        let mut report = DeliveryReport::default();
        for (entry, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered.push(entry.id),
                Err(e) => {
                    warn!(
                        origin = %origin,
                        recipient = %entry.id,
                        name = %entry.display_name,
                        "Failed to deliver message: {}", e
                    );
                    report.failed.push(entry.id);
                }
            }
        }

        debug!(
            origin = %origin,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }
}
