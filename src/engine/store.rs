use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// Everything the engine holds for one property: the DateSlot store plus the
/// bookings, rules, blocks and calendar links that drive it.
///
/// Slots are stored sparsely. A night without a row is `available` with source
/// `rule`; rows exist only for nights some booking, block or import claims.
#[derive(Debug, Clone)]
pub struct PropertyState {
    pub property: Property,
    pub slots: BTreeMap<NaiveDate, StoredSlot>,
    /// Every booking ever made (cancelled ones included), sorted by `range.start`.
    pub bookings: Vec<Booking>,
    pub rules: Vec<PricingRule>,
    pub blocks: Vec<Block>,
    pub links: Vec<CalendarLink>,
}

const FREE: StoredSlot = StoredSlot {
    status: SlotStatus::Available,
    source: SlotSource::Rule,
};

impl PropertyState {
    pub fn new(property: Property) -> Self {
        Self {
            property,
            slots: BTreeMap::new(),
            bookings: Vec::new(),
            rules: Vec::new(),
            blocks: Vec::new(),
            links: Vec::new(),
        }
    }

    // ── Slot reads ───────────────────────────────────────────────

    pub fn slot(&self, date: NaiveDate) -> StoredSlot {
        self.slots.get(&date).copied().unwrap_or(FREE)
    }

    /// Stored rows inside `range`, in date order.
    pub fn slots_in(&self, range: &DateRange) -> impl Iterator<Item = (&NaiveDate, &StoredSlot)> {
        self.slots.range(range.start..range.end)
    }

    /// Nights in `range` with the given status, merged into ranges.
    pub fn ranges_with_status(&self, range: &DateRange, status: SlotStatus) -> Vec<DateRange> {
        DateRange::from_dates(
            self.slots_in(range)
                .filter(|(_, s)| s.status == status)
                .map(|(d, _)| *d),
        )
    }

    /// What a night falls back to when nothing books it: a manual block, a
    /// blocking import, or plain availability.
    fn resting_slot(&self, date: NaiveDate) -> Option<StoredSlot> {
        if self.blocks.iter().any(|b| b.range.contains(date)) {
            return Some(StoredSlot {
                status: SlotStatus::Blocked,
                source: SlotSource::Manual,
            });
        }
        self.links
            .iter()
            .find(|l| l.policy == ConflictPolicy::Block && l.imported.contains(&date))
            .map(|l| StoredSlot {
                status: SlotStatus::Blocked,
                source: SlotSource::External(l.id),
            })
    }

    // ── Slot writes ──────────────────────────────────────────────

    fn mark(&mut self, range: &DateRange, slot: StoredSlot) {
        for date in range.dates() {
            self.slots.insert(date, slot);
        }
    }

    fn reset_to_rest(&mut self, date: NaiveDate) {
        match self.resting_slot(date) {
            Some(slot) => {
                self.slots.insert(date, slot);
            }
            None => {
                self.slots.remove(&date);
            }
        }
    }

    /// Give back every night in `range` still held by `source`.
    fn release(&mut self, range: &DateRange, source: SlotSource) {
        for date in range.dates() {
            if self.slot(date).source == source {
                self.reset_to_rest(date);
            }
        }
    }

    /// Block free nights for `source`. Nights held by bookings or manual blocks keep their owner.
    fn block_free(&mut self, dates: impl Iterator<Item = NaiveDate>, source: SlotSource) {
        for date in dates {
            if self.slot(date).status == SlotStatus::Available {
                self.slots.insert(
                    date,
                    StoredSlot {
                        status: SlotStatus::Blocked,
                        source,
                    },
                );
            }
        }
    }

    // ── Bookings ─────────────────────────────────────────────────

    /// Insert a booking keeping the list sorted by start date.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.range.start <= booking.range.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings of any status whose range overlaps `query`.
    /// Binary search skips every booking starting at or after `query.end`.
    pub fn overlapping_bookings(&self, query: &DateRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.range.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end > query.start)
    }

    pub fn link(&self, id: &Ulid) -> Option<&CalendarLink> {
        self.links.iter().find(|l| l.id == *id)
    }

    pub fn link_mut(&mut self, id: &Ulid) -> Option<&mut CalendarLink> {
        self.links.iter_mut().find(|l| l.id == *id)
    }

    // ── Event application ────────────────────────────────────────

    /// Apply a committed event. Property creation and deletion are handled by
    /// the engine's property map, not here.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::PropertyUpdated { property } => {
                self.property = property.clone();
            }
            Event::RuleAdded { rule } => {
                self.rules.push(rule.clone());
            }
            Event::RuleRemoved { id, .. } => {
                self.rules.retain(|r| r.id != *id);
            }
            Event::BlockAdded { id, range, .. } => {
                self.blocks.push(Block { id: *id, range: *range });
                for date in range.dates() {
                    let current = self.slot(date);
                    if matches!(current.source, SlotSource::Rule | SlotSource::External(_)) {
                        self.slots.insert(
                            date,
                            StoredSlot {
                                status: SlotStatus::Blocked,
                                source: SlotSource::Manual,
                            },
                        );
                    }
                }
            }
            Event::BlockRemoved { id, .. } => {
                if let Some(pos) = self.blocks.iter().position(|b| b.id == *id) {
                    let block = self.blocks.remove(pos);
                    self.release(&block.range, SlotSource::Manual);
                }
            }
            Event::BookingCreated { booking } => {
                let id = booking.id;
                let range = booking.range;
                let held = booking.status.slot_status();
                self.insert_booking(booking.clone());
                if let Some(status) = held {
                    self.mark(&range, StoredSlot { status, source: SlotSource::Booking(id) });
                }
            }
            Event::BookingTransitioned {
                id,
                to,
                at,
                reason,
                reference,
                ..
            } => {
                let Some(booking) = self.booking_mut(id) else { return };
                booking.status = *to;
                booking.updated_at = *at;
                if *to == BookingStatus::Confirmed {
                    booking.confirmed_at = Some(*at);
                }
                if *to != BookingStatus::PendingPayment {
                    booking.payment_deadline = None;
                }
                if reason.is_some() {
                    booking.cancel_reason = *reason;
                }
                if reference.is_some() {
                    booking.payment_reference = reference.clone();
                }
                let range = booking.range;
                match to.slot_status() {
                    Some(status) => {
                        self.mark(&range, StoredSlot { status, source: SlotSource::Booking(*id) })
                    }
                    None => self.release(&range, SlotSource::Booking(*id)),
                }
            }
            Event::LinkAdded { link } => {
                let blocking = link.policy == ConflictPolicy::Block;
                let (id, imported) = (link.id, link.imported.clone());
                self.links.push(link.clone());
                if blocking {
                    self.block_free(imported.into_iter(), SlotSource::External(id));
                }
            }
            Event::LinkRemoved { id, retained, .. } => {
                self.links.retain(|l| l.id != *id);
                self.blocks.extend(retained.iter().cloned());
                let held: Vec<NaiveDate> = self
                    .slots
                    .iter()
                    .filter(|(_, s)| s.source == SlotSource::External(*id))
                    .map(|(d, _)| *d)
                    .collect();
                for date in held {
                    self.reset_to_rest(date);
                }
            }
            Event::ImportApplied {
                link_id,
                added,
                removed,
                at,
                next_attempt_at,
                ..
            } => {
                let Some(link) = self.link_mut(link_id) else { return };
                for range in removed {
                    for date in range.dates() {
                        link.imported.remove(&date);
                    }
                }
                for range in added {
                    link.imported.extend(range.dates());
                }
                link.status = LinkStatus::Connected;
                link.last_sync = Some(*at);
                link.last_error = None;
                link.consecutive_failures = 0;
                link.next_attempt_at = *next_attempt_at;
                let blocking = link.policy == ConflictPolicy::Block;

                let source = SlotSource::External(*link_id);
                for range in removed {
                    self.release(range, source);
                }
                if blocking {
                    for range in added {
                        self.block_free(range.dates(), source);
                    }
                }
            }
            Event::LinkFailed {
                link_id,
                error,
                failures,
                next_attempt_at,
                ..
            } => {
                if let Some(link) = self.link_mut(link_id) {
                    link.status = LinkStatus::Error;
                    link.last_error = Some(error.clone());
                    link.consecutive_failures = *failures;
                    link.next_attempt_at = *next_attempt_at;
                }
            }
            Event::PropertyCreated { .. } | Event::PropertyDeleted { .. } => {}
        }
    }

    /// Minimal event list that rebuilds this state from nothing.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let pid = self.property.id;
        let mut events = vec![Event::PropertyCreated {
            property: self.property.clone(),
        }];
        events.extend(self.blocks.iter().map(|b| Event::BlockAdded {
            id: b.id,
            property_id: pid,
            range: b.range,
        }));
        events.extend(self.links.iter().map(|l| Event::LinkAdded { link: l.clone() }));
        events.extend(self.rules.iter().map(|r| Event::RuleAdded { rule: r.clone() }));
        // Bookings last: their nights take precedence over blocks and imports.
        events.extend(self.bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        events
    }
}
