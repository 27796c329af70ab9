use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability;

use super::approval::initial_status;
use super::conflict::{blocking_bookings, check_bookable, validate_stay};
use super::pricing::price;
use super::{Engine, EngineError, PropertyState, unindex_property};

/// A guest's request to reserve a stay.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub property_id: Ulid,
    pub guest: String,
    pub range: DateRange,
    pub guests: u32,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOutcome {
    pub booking: Booking,
    /// True when the idempotency key matched an earlier request and nothing new was created.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub booking: Booking,
    /// False for duplicate or out-of-order deliveries that left the booking as it was.
    pub changed: bool,
}

fn validate_property(property: &Property) -> Result<(), EngineError> {
    if property.owner.is_empty() || property.owner.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("owner must be 1..=256 bytes"));
    }
    if property.capacity == 0 || property.capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity out of range"));
    }
    if property.included_guests > property.capacity {
        return Err(EngineError::LimitExceeded("included guests exceed capacity"));
    }
    let fees = [property.base_rate, property.cleaning_fee, property.extra_guest_fee];
    if fees.iter().any(Decimal::is_sign_negative) {
        return Err(EngineError::LimitExceeded("rates and fees must not be negative"));
    }
    if fees.iter().any(|fee| *fee > Decimal::from(MAX_AMOUNT)) {
        return Err(EngineError::LimitExceeded("rates and fees must not exceed 1000000000"));
    }
    Ok(())
}

fn validate_rule(rule: &PricingRule) -> Result<(), EngineError> {
    if rule.value.is_sign_negative() {
        return Err(EngineError::LimitExceeded("rule value must not be negative"));
    }
    let ceiling = match rule.kind {
        RuleKind::Override | RuleKind::WeekendUplift => Decimal::from(MAX_AMOUNT),
        RuleKind::SeasonalPercent => Decimal::from(MAX_PERCENT),
        RuleKind::DiscountPercent => Decimal::ONE_HUNDRED,
    };
    if rule.value > ceiling {
        return Err(EngineError::LimitExceeded(match rule.kind {
            RuleKind::DiscountPercent => "discount above 100%",
            RuleKind::SeasonalPercent => "seasonal percentage above 1000%",
            RuleKind::Override | RuleKind::WeekendUplift => "rule amount above 1000000000",
        }));
    }
    Ok(())
}

fn require_owner(ps: &PropertyState, actor: &str) -> Result<(), EngineError> {
    if ps.property.owner != actor {
        return Err(EngineError::Forbidden("only the property owner can change its calendar"));
    }
    Ok(())
}

/// An idempotency key held by in-flight booking attempts. Each attempt holds
/// one count; the key is released when the last attempt finishes.
struct KeyClaim<'a> {
    claims: &'a DashMap<String, (Ulid, usize)>,
    key: String,
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove_if_mut(&self.key, |_, (_, holders)| {
            *holders -= 1;
            *holders == 0
        });
    }
}

impl Engine {
    /// Stake the request's key for its property. Attempts on the same property
    /// serialize on its lock and replay; an attempt on another property is a reuse.
    fn claim_key(&self, req: &BookingRequest) -> Result<KeyClaim<'_>, EngineError> {
        match self.key_claims.entry(req.idempotency_key.clone()) {
            Entry::Occupied(mut e) => {
                let (property_id, holders) = e.get_mut();
                if *property_id != req.property_id {
                    return Err(EngineError::IdempotencyKeyReused(req.idempotency_key.clone()));
                }
                *holders += 1;
            }
            Entry::Vacant(e) => {
                e.insert((req.property_id, 1));
            }
        }
        Ok(KeyClaim {
            claims: &self.key_claims,
            key: req.idempotency_key.clone(),
        })
    }

    // ── Properties ───────────────────────────────────────────

    pub async fn create_property(&self, property: Property) -> Result<(), EngineError> {
        validate_property(&property)?;
        if self.state.len() >= MAX_PROPERTIES {
            return Err(EngineError::LimitExceeded("too many properties"));
        }
        if self.state.contains_key(&property.id) {
            return Err(EngineError::AlreadyExists(property.id));
        }

        let id = property.id;
        let event = Event::PropertyCreated { property: property.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(PropertyState::new(property))));
        self.notify.changed(id, &event);
        tracing::info!("property {id} created");
        Ok(())
    }

    /// Replace a property's settings. Identity and owner are immutable.
    pub async fn update_property(&self, property: Property, actor: &str) -> Result<(), EngineError> {
        validate_property(&property)?;
        let mut guard = self.write_property(&property.id).await?;
        require_owner(&guard, actor)?;
        if guard.property.owner != property.owner {
            return Err(EngineError::Forbidden("property owner cannot be changed"));
        }
        let event = Event::PropertyUpdated { property };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn set_property_active(&self, id: Ulid, active: bool, actor: &str) -> Result<(), EngineError> {
        let mut guard = self.write_property(&id).await?;
        require_owner(&guard, actor)?;
        if guard.property.active == active {
            return Ok(());
        }
        let mut property = guard.property.clone();
        property.active = active;
        let event = Event::PropertyUpdated { property };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete a property that never had a booking. Otherwise deactivate it instead.
    pub async fn delete_property(&self, id: Ulid, actor: &str) -> Result<(), EngineError> {
        let guard = self.write_property(&id).await?;
        require_owner(&guard, actor)?;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::PropertyDeleted { id };
        self.wal_append(&event).await?;
        unindex_property(&guard, &self.entity_to_property);
        self.state.remove(&id);
        self.notify.changed(id, &event);
        self.notify.remove(&id);
        tracing::info!("property {id} deleted");
        Ok(())
    }

    // ── Pricing rules and blocks ─────────────────────────────

    pub async fn add_pricing_rule(&self, rule: PricingRule, actor: &str) -> Result<(), EngineError> {
        validate_rule(&rule)?;
        if self.entity_to_property.contains_key(&rule.id) {
            return Err(EngineError::AlreadyExists(rule.id));
        }
        let mut guard = self.write_property(&rule.property_id).await?;
        require_owner(&guard, actor)?;
        if guard.rules.len() >= MAX_RULES_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many pricing rules on property"));
        }
        // Existing bookings keep the breakdown they were created with.
        let event = Event::RuleAdded { rule };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_pricing_rule(&self, id: Ulid, actor: &str) -> Result<Ulid, EngineError> {
        let (property_id, mut guard) = self.resolve_entity_write(&id).await?;
        require_owner(&guard, actor)?;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id, property_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(property_id)
    }

    /// Close a range by hand. Nights held by active bookings cannot be blocked.
    pub async fn add_block(
        &self,
        id: Ulid,
        property_id: Ulid,
        range: DateRange,
        actor: &str,
    ) -> Result<(), EngineError> {
        super::conflict::validate_window(&range)?;
        if self.entity_to_property.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.write_property(&property_id).await?;
        require_owner(&guard, actor)?;
        if guard.blocks.len() >= MAX_BLOCKS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many blocks on property"));
        }
        if let Some(holder) = blocking_bookings(&guard, &range).first() {
            return Err(EngineError::SlotConflict {
                range: holder.range.intersection(&range).unwrap_or(range),
                booking: Some(holder.id),
            });
        }
        let event = Event::BlockAdded { id, property_id, range };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_block(&self, id: Ulid, actor: &str) -> Result<Ulid, EngineError> {
        let (property_id, mut guard) = self.resolve_entity_write(&id).await?;
        require_owner(&guard, actor)?;
        if !guard.blocks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BlockRemoved { id, property_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(property_id)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// The booking an idempotency key already produced, if the key was used before.
    /// A key reused for a different property or range is an error.
    fn replay_of(&self, ps: &PropertyState, req: &BookingRequest) -> Result<Option<Booking>, EngineError> {
        let Some(existing) = self.idempotency.get(&req.idempotency_key).map(|e| *e.value()) else {
            return Ok(None);
        };
        match ps.booking(&existing) {
            Some(b) if b.range == req.range && b.guest == req.guest => Ok(Some(b.clone())),
            _ => Err(EngineError::IdempotencyKeyReused(req.idempotency_key.clone())),
        }
    }

    /// Reserve a stay. Under the property's write lock the range is re-checked
    /// against every active booking and block, priced, and committed as a
    /// pending booking; concurrent attempts on overlapping nights see each
    /// other and all but one fail with `SlotConflict`.
    pub async fn create_booking(&self, req: BookingRequest, now: Ms) -> Result<BookingOutcome, EngineError> {
        let outcome = self.try_create_booking(req, now).await;
        let label = match &outcome {
            Ok(o) if o.replayed => "replayed",
            Ok(_) => "created",
            Err(e) if e.is_conflict() => "conflict",
            Err(_) => "rejected",
        };
        metrics::counter!(observability::BOOKING_ATTEMPTS_TOTAL, "outcome" => label).increment(1);
        outcome
    }

    async fn try_create_booking(&self, req: BookingRequest, now: Ms) -> Result<BookingOutcome, EngineError> {
        if req.idempotency_key.is_empty() || req.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EngineError::LimitExceeded("idempotency key must be 1..=256 bytes"));
        }
        if req.guest.is_empty() || req.guest.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("guest must be 1..=256 bytes"));
        }

        // Retries of a committed request are answered before date validation,
        // so a replay still works after check-in day has passed.
        if let Some(owner) = self
            .idempotency
            .get(&req.idempotency_key)
            .and_then(|e| self.get_property_for_entity(e.value()))
        {
            if owner != req.property_id {
                return Err(EngineError::IdempotencyKeyReused(req.idempotency_key.clone()));
            }
            let ps = self
                .get_property_state(&owner)
                .ok_or(EngineError::NotFound(owner))?;
            let guard = ps.read().await;
            if let Some(booking) = self.replay_of(&guard, &req)? {
                return Ok(BookingOutcome { booking, replayed: true });
            }
        }

        validate_stay(&req.range, now, self.config.horizon_days)?;
        let _claim = self.claim_key(&req)?;
        let mut guard = self.write_property(&req.property_id).await?;

        // Same key racing on the same property: the loser replays.
        if let Some(booking) = self.replay_of(&guard, &req)? {
            return Ok(BookingOutcome { booking, replayed: true });
        }
        if !guard.property.active {
            return Err(EngineError::PropertyInactive(req.property_id));
        }
        if req.guests == 0 || req.guests > guard.property.capacity {
            return Err(EngineError::CapacityExceeded {
                requested: req.guests,
                capacity: guard.property.capacity,
            });
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many bookings on property"));
        }

        check_bookable(&guard, &req.range)?;

        let quote = price(
            &guard.property,
            &guard.rules,
            &req.range,
            req.guests,
            &self.config.pricing,
        );
        let status = initial_status(guard.property.booking_mode);
        let payment_deadline = (status == BookingStatus::PendingPayment)
            .then(|| now + self.config.payment_timeout.as_millis() as Ms);
        let booking = Booking {
            id: Ulid::new(),
            property_id: req.property_id,
            guest: req.guest,
            range: req.range,
            guests: req.guests,
            price: quote,
            status,
            created_at: now,
            confirmed_at: None,
            updated_at: now,
            payment_deadline,
            payment_reference: None,
            cancel_reason: None,
            idempotency_key: req.idempotency_key,
        };

        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;

        if let Some(deadline) = payment_deadline {
            self.notify.send(
                booking.property_id,
                Notification::PaymentRequired {
                    booking_id: booking.id,
                    amount: booking.price.total,
                    currency: booking.price.currency.clone(),
                    deadline,
                },
            );
        }
        self.warn_external_overlaps(&guard, &booking.range);

        tracing::info!(
            "booking {} on property {} for {} created as {}",
            booking.id,
            booking.property_id,
            booking.range,
            booking.status
        );
        Ok(BookingOutcome { booking, replayed: false })
    }

    /// Tell the owner when a new booking lands on nights a `notify` feed has taken.
    fn warn_external_overlaps(&self, ps: &PropertyState, range: &DateRange) {
        for link in ps.links.iter().filter(|l| l.policy == ConflictPolicy::Notify) {
            for overlap in DateRange::from_dates(range.dates().filter(|d| link.imported.contains(d))) {
                tracing::warn!("booking on {overlap} overlaps external calendar {}", link.id);
                self.notify.send(
                    ps.property.id,
                    Notification::ExternalOverlap { link_id: link.id, range: overlap },
                );
            }
        }
    }

    /// Move a booking along its state machine and persist the step.
    /// Caller holds the property's write lock.
    pub(super) async fn transition(
        &self,
        ps: &mut PropertyState,
        id: Ulid,
        to: BookingStatus,
        at: Ms,
        reason: Option<CancelReason>,
        reference: Option<String>,
    ) -> Result<Booking, EngineError> {
        let booking = ps.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                to,
            });
        }
        let event = Event::BookingTransitioned {
            id,
            property_id: booking.property_id,
            to,
            at,
            reason,
            reference,
        };
        self.persist_and_apply(ps, &event).await?;
        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        ps.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Apply the payment collaborator's verdict. Only a `pending_payment`
    /// booking reacts; duplicates and late deliveries leave it unchanged.
    pub async fn record_payment(
        &self,
        booking_id: Ulid,
        result: PaymentResult,
        now: Ms,
    ) -> Result<TransitionOutcome, EngineError> {
        if result.reference().len() > MAX_REFERENCE_LEN {
            return Err(EngineError::LimitExceeded("payment reference too long"));
        }
        let (_, mut guard) = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        let (to, reason) = match (&result, current.status) {
            (PaymentResult::Paid { .. }, BookingStatus::PendingPayment) => (BookingStatus::Confirmed, None),
            (PaymentResult::Failed { .. }, BookingStatus::PendingPayment) => {
                (BookingStatus::Cancelled, Some(CancelReason::PaymentFailed))
            }
            (PaymentResult::Paid { reference }, BookingStatus::Cancelled) => {
                tracing::warn!(
                    "payment {reference} arrived for cancelled booking {booking_id}; refund required"
                );
                metrics::counter!(observability::PAYMENT_CALLBACKS_TOTAL, "result" => "ignored").increment(1);
                return Ok(TransitionOutcome { booking: current, changed: false });
            }
            (_, status) => {
                tracing::debug!("payment callback for booking {booking_id} in {status} ignored");
                metrics::counter!(observability::PAYMENT_CALLBACKS_TOTAL, "result" => "duplicate").increment(1);
                return Ok(TransitionOutcome { booking: current, changed: false });
            }
        };

        let booking = self
            .transition(&mut guard, booking_id, to, now, reason, Some(result.reference().to_string()))
            .await?;
        metrics::counter!(observability::PAYMENT_CALLBACKS_TOTAL, "result" => "applied").increment(1);
        tracing::info!("booking {booking_id} is {} after payment {}", booking.status, result.reference());
        Ok(TransitionOutcome { booking, changed: true })
    }

    /// Cancel on behalf of the guest or the owner. Cancelling twice is a no-op.
    pub async fn cancel_booking(&self, booking_id: Ulid, actor: &str) -> Result<TransitionOutcome, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&booking_id).await?;
        let current = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let reason = if actor == current.guest {
            CancelReason::Guest
        } else if actor == guard.property.owner {
            CancelReason::Owner
        } else {
            return Err(EngineError::Forbidden("only the guest or the owner can cancel a booking"));
        };
        if current.status == BookingStatus::Cancelled {
            return Ok(TransitionOutcome { booking: current, changed: false });
        }
        let booking = self
            .transition(&mut guard, booking_id, BookingStatus::Cancelled, super::now_ms(), Some(reason), None)
            .await?;
        tracing::info!("booking {booking_id} cancelled by {}", reason.as_str());
        Ok(TransitionOutcome { booking, changed: true })
    }

    pub async fn check_in(&self, booking_id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&booking_id).await?;
        self.transition(&mut guard, booking_id, BookingStatus::CheckedIn, now, None, None)
            .await
    }

    /// Check-out. The stay's nights return to the calendar.
    pub async fn complete(&self, booking_id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&booking_id).await?;
        self.transition(&mut guard, booking_id, BookingStatus::Completed, now, None, None)
            .await
    }

    /// `pending_payment` bookings whose deadline has passed, as (booking, property).
    /// Contended properties are skipped; the next sweep picks them up.
    pub fn collect_overdue_payments(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut overdue = Vec::new();
        for entry in self.state.iter() {
            let ps = entry.value().clone();
            if let Ok(guard) = ps.try_read() {
                for booking in &guard.bookings {
                    if booking.status == BookingStatus::PendingPayment
                        && booking.payment_deadline.is_some_and(|d| d <= now)
                    {
                        overdue.push((booking.id, guard.property.id));
                    }
                }
            }
        }
        overdue
    }

    /// Cancel every overdue `pending_payment` booking with reason `payment_timeout`.
    /// Returns the ids that were cancelled.
    pub async fn expire_pending_payments(&self, now: Ms) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for (booking_id, property_id) in self.collect_overdue_payments(now) {
            let Ok(mut guard) = self.write_property(&property_id).await else { continue };
            // A payment may have landed between the scan and the lock.
            let still_overdue = guard.booking(&booking_id).is_some_and(|b| {
                b.status == BookingStatus::PendingPayment && b.payment_deadline.is_some_and(|d| d <= now)
            });
            if !still_overdue {
                continue;
            }
            match self
                .transition(
                    &mut guard,
                    booking_id,
                    BookingStatus::Cancelled,
                    now,
                    Some(CancelReason::PaymentTimeout),
                    None,
                )
                .await
            {
                Ok(_) => {
                    metrics::counter!(observability::PAYMENT_TIMEOUTS_TOTAL).increment(1);
                    expired.push(booking_id);
                }
                Err(e) => tracing::warn!("failed to expire booking {booking_id}: {e}"),
            }
        }
        expired
    }
}
