use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use crate::model::{Commitment, CustomerRef};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Outbound "your booking is in" hook. Called after the commit has been
/// made durable and the staff lock released; errors are logged, never
/// surfaced to the booking caller.
#[async_trait]
pub trait BookingNotifier: Send + Sync {
    async fn booking_created(
        &self,
        customer: &CustomerRef,
        commitment: &Commitment,
    ) -> Result<(), NotifyError>;
}

/// Default notifier: writes the booking to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl BookingNotifier for LogNotifier {
    async fn booking_created(
        &self,
        customer: &CustomerRef,
        commitment: &Commitment,
    ) -> Result<(), NotifyError> {
        let payload =
            serde_json::to_string(commitment).map_err(|e| NotifyError::Delivery(e.to_string()))?;
        info!(customer = %customer.id(), booking = %commitment.id, %payload, "booking created");
        Ok(())
    }
}

/// Fans created bookings out to in-process subscribers.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Commitment>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Commitment> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BookingNotifier for BroadcastNotifier {
    async fn booking_created(
        &self,
        _customer: &CustomerRef,
        commitment: &Commitment,
    ) -> Result<(), NotifyError> {
        // No subscribers is not a failure.
        let _ = self.sender.send(commitment.clone());
        Ok(())
    }
}
