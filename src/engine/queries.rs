use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_window;
use super::pricing::{nightly_rate, price};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_property(&self, id: &Ulid) -> Option<Property> {
        let ps = self.get_property_state(id)?;
        let guard = ps.read().await;
        Some(guard.property.clone())
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let property_id = self.get_property_for_entity(id)?;
        let ps = self.get_property_state(&property_id)?;
        let guard = ps.read().await;
        guard.booking(id).cloned()
    }

    /// Every booking of a property, cancelled ones included, in start order.
    pub async fn list_bookings(&self, property_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        Ok(guard.bookings.clone())
    }

    /// One DateSlot per night of `range`, with status, source and effective price.
    pub async fn availability(&self, property_id: Ulid, range: DateRange) -> Result<Vec<DateSlot>, EngineError> {
        validate_window(&range)?;
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        let weekend = &self.config.pricing.weekend_days;
        let dp = self.config.pricing.minor_units;

        Ok(range
            .dates()
            .map(|date| {
                let slot = guard.slot(date);
                let rate = nightly_rate(&guard.property, &guard.rules, date, weekend).rate;
                DateSlot {
                    property_id,
                    date,
                    status: slot.status,
                    price: rate.round_dp_with_strategy(dp, rust_decimal::RoundingStrategy::MidpointAwayFromZero),
                    source: slot.source,
                }
            })
            .collect())
    }

    /// Price a prospective stay without reserving anything.
    pub async fn price_quote(
        &self,
        property_id: Ulid,
        range: DateRange,
        guests: u32,
    ) -> Result<PriceBreakdown, EngineError> {
        validate_window(&range)?;
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        if guests == 0 || guests > guard.property.capacity {
            return Err(EngineError::CapacityExceeded {
                requested: guests,
                capacity: guard.property.capacity,
            });
        }
        Ok(price(&guard.property, &guard.rules, &range, guests, &self.config.pricing))
    }

    pub async fn list_pricing_rules(&self, property_id: Ulid) -> Result<Vec<PricingRule>, EngineError> {
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        Ok(guard.rules.clone())
    }

    pub async fn list_blocks(&self, property_id: Ulid) -> Result<Vec<Block>, EngineError> {
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        Ok(guard.blocks.clone())
    }

    pub async fn list_calendar_links(&self, property_id: Ulid) -> Result<Vec<CalendarLink>, EngineError> {
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        Ok(guard.links.clone())
    }
}
