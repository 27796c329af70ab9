use ulid::Ulid;

use crate::model::*;

use super::mutations::TransitionOutcome;
use super::{Engine, EngineError, now_ms};

/// Status a new booking starts in, by the property's booking mode.
pub fn initial_status(mode: BookingMode) -> BookingStatus {
    match mode {
        BookingMode::Instant => BookingStatus::PendingPayment,
        BookingMode::Request => BookingStatus::PendingApproval,
    }
}

impl Engine {
    /// Owner accepts a booking request. The booking is confirmed and its nights booked.
    pub async fn approve(&self, booking_id: Ulid, actor: &str) -> Result<TransitionOutcome, EngineError> {
        self.decide(booking_id, actor, BookingStatus::Confirmed, None).await
    }

    /// Owner turns a booking request down. Its nights are released.
    pub async fn decline(&self, booking_id: Ulid, actor: &str) -> Result<TransitionOutcome, EngineError> {
        self.decide(booking_id, actor, BookingStatus::Cancelled, Some(CancelReason::Declined))
            .await
    }

    async fn decide(
        &self,
        booking_id: Ulid,
        actor: &str,
        to: BookingStatus,
        reason: Option<CancelReason>,
    ) -> Result<TransitionOutcome, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&booking_id).await?;
        if guard.property.owner != actor {
            return Err(EngineError::Forbidden("only the property owner can decide on a booking request"));
        }
        let status = guard
            .booking(&booking_id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(booking_id))?;
        if status != BookingStatus::PendingApproval {
            return Err(EngineError::NotPendingApproval(booking_id));
        }
        let booking = self
            .transition(&mut guard, booking_id, to, now_ms(), reason, None)
            .await?;
        tracing::info!("booking {booking_id} {} by owner", if to == BookingStatus::Confirmed { "approved" } else { "declined" });
        Ok(TransitionOutcome { booking, changed: true })
    }
}
