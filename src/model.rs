use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for every wall-clock timestamp.
pub type Ms = i64;

pub const MS_PER_DAY: Ms = 86_400_000;

/// Calendar day containing the instant `now` (UTC).
pub fn day_of(now: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(now)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// Half-open range of nights `[start, end)`. The checkout day is not occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateRange start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted ranges.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    pub fn intersection(&self, other: &DateRange) -> Option<DateRange> {
        DateRange::try_new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Every night in the range, in order.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }

    /// Collapse a sorted set of nights into maximal consecutive ranges.
    pub fn from_dates<I: IntoIterator<Item = NaiveDate>>(dates: I) -> Vec<DateRange> {
        let mut ranges: Vec<DateRange> = Vec::new();
        for date in dates {
            let Some(next) = date.succ_opt() else { continue };
            if let Some(last) = ranges.last_mut()
                && last.end == date
            {
                last.end = next;
                continue;
            }
            ranges.push(DateRange::new(date, next));
        }
        ranges
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Property ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingMode {
    /// Booking waits only for payment.
    Instant,
    /// Booking waits for the owner's approval.
    Request,
}

impl BookingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingMode::Instant => "instant",
            BookingMode::Request => "request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "instant" => Some(BookingMode::Instant),
            "request" => Some(BookingMode::Request),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: Ulid,
    pub owner: String,
    pub capacity: u32,
    pub base_rate: Decimal,
    pub booking_mode: BookingMode,
    pub cleaning_fee: Decimal,
    /// Guests covered by the nightly rate; each extra guest pays `extra_guest_fee` per night.
    pub included_guests: u32,
    pub extra_guest_fee: Decimal,
    pub active: bool,
}

impl Property {
    pub fn new(id: Ulid, owner: impl Into<String>, capacity: u32, base_rate: Decimal) -> Self {
        Self {
            id,
            owner: owner.into(),
            capacity,
            base_rate,
            booking_mode: BookingMode::Instant,
            cleaning_fee: Decimal::ZERO,
            included_guests: capacity,
            extra_guest_fee: Decimal::ZERO,
            active: true,
        }
    }
}

// ── Date slots ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Blocked,
    Booked,
    Pending,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Blocked => "blocked",
            SlotStatus::Booked => "booked",
            SlotStatus::Pending => "pending",
        }
    }
}

/// Who put a slot into its current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotSource {
    Manual,
    Rule,
    External(Ulid),
    Booking(Ulid),
}

impl fmt::Display for SlotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotSource::Manual => write!(f, "manual"),
            SlotSource::Rule => write!(f, "rule"),
            SlotSource::External(link) => write!(f, "external:{link}"),
            SlotSource::Booking(id) => write!(f, "booking:{id}"),
        }
    }
}

/// Persisted part of a slot. Nights without a stored row are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSlot {
    pub status: SlotStatus,
    pub source: SlotSource,
}

/// Per-property, per-night availability record with its effective price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateSlot {
    pub property_id: Ulid,
    pub date: NaiveDate,
    pub status: SlotStatus,
    pub price: Decimal,
    pub source: SlotSource,
}

/// Owner-entered closure of a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub range: DateRange,
}

// ── Pricing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Replaces the nightly rate outright.
    Override,
    /// Absolute amount added on weekend nights.
    WeekendUplift,
    /// Percentage added to the base rate.
    SeasonalPercent,
    /// Percentage taken off the base rate.
    DiscountPercent,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Override => "override",
            RuleKind::WeekendUplift => "weekend_uplift",
            RuleKind::SeasonalPercent => "seasonal_percent",
            RuleKind::DiscountPercent => "discount_percent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "override" => Some(RuleKind::Override),
            "weekend_uplift" => Some(RuleKind::WeekendUplift),
            "seasonal_percent" => Some(RuleKind::SeasonalPercent),
            "discount_percent" => Some(RuleKind::DiscountPercent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: Ulid,
    pub property_id: Ulid,
    pub range: DateRange,
    pub kind: RuleKind,
    pub value: Decimal,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightlyRate {
    pub date: NaiveDate,
    pub rate: Decimal,
    /// Rule that shaped this night's rate, if any. Percent rules report the highest-priority one.
    pub rule_id: Option<Ulid>,
    pub kind: Option<RuleKind>,
}

/// Priced stay. Snapshotted into the booking at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub nights: u32,
    pub per_night: Vec<NightlyRate>,
    pub extra_guest_fee: Decimal,
    pub subtotal: Decimal,
    pub cleaning_fee: Decimal,
    pub service_fee: Decimal,
    pub taxes: Decimal,
    pub total: Decimal,
    pub currency: String,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    PendingPayment,
    PendingApproval,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings hold their nights and take part in conflict checks.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BookingStatus::PendingPayment
                | BookingStatus::PendingApproval
                | BookingStatus::Confirmed
                | BookingStatus::CheckedIn
        )
    }

    pub fn is_pending(self) -> bool {
        matches!(self, BookingStatus::PendingPayment | BookingStatus::PendingApproval)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (PendingPayment, Confirmed)
                | (PendingApproval, Confirmed)
                | (Confirmed, CheckedIn)
                | (CheckedIn, Completed)
                | (PendingPayment | PendingApproval | Confirmed | CheckedIn, Cancelled)
        )
    }

    /// Slot status implied by a booking in this state, if it holds its nights.
    pub fn slot_status(self) -> Option<SlotStatus> {
        match self {
            BookingStatus::PendingPayment | BookingStatus::PendingApproval => Some(SlotStatus::Pending),
            BookingStatus::Confirmed | BookingStatus::CheckedIn => Some(SlotStatus::Booked),
            BookingStatus::Completed | BookingStatus::Cancelled => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::PendingPayment => "pending_payment",
            BookingStatus::PendingApproval => "pending_approval",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    Guest,
    Owner,
    Declined,
    PaymentFailed,
    PaymentTimeout,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Guest => "guest",
            CancelReason::Owner => "owner",
            CancelReason::Declined => "declined",
            CancelReason::PaymentFailed => "payment_failed",
            CancelReason::PaymentTimeout => "payment_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub property_id: Ulid,
    pub guest: String,
    pub range: DateRange,
    pub guests: u32,
    pub price: PriceBreakdown,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub confirmed_at: Option<Ms>,
    pub updated_at: Ms,
    /// Set while `PendingPayment`; the booking auto-cancels after it.
    pub payment_deadline: Option<Ms>,
    pub payment_reference: Option<String>,
    pub cancel_reason: Option<CancelReason>,
    pub idempotency_key: String,
}

/// Result reported by the payment collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentResult {
    Paid { reference: String },
    Failed { reference: String },
}

impl PaymentResult {
    pub fn reference(&self) -> &str {
        match self {
            PaymentResult::Paid { reference } | PaymentResult::Failed { reference } => reference,
        }
    }
}

// ── External calendars ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkDirection {
    Import,
    Export,
    Bidirectional,
}

impl LinkDirection {
    pub fn imports(self) -> bool {
        matches!(self, LinkDirection::Import | LinkDirection::Bidirectional)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkDirection::Import => "import",
            LinkDirection::Export => "export",
            LinkDirection::Bidirectional => "bidirectional",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "import" => Some(LinkDirection::Import),
            "export" => Some(LinkDirection::Export),
            "bidirectional" => Some(LinkDirection::Bidirectional),
            _ => None,
        }
    }
}

/// What an import does with nights it cannot or may not take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Imported nights become blocked; new local bookings over them are rejected.
    Block,
    /// Imported nights are recorded; overlaps raise an owner warning.
    Notify,
    /// Imported nights are recorded only.
    Ignore,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::Block => "block",
            ConflictPolicy::Notify => "notify",
            ConflictPolicy::Ignore => "ignore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Some(ConflictPolicy::Block),
            "notify" => Some(ConflictPolicy::Notify),
            "ignore" => Some(ConflictPolicy::Ignore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Connected,
    Error,
    Syncing,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Connected => "connected",
            LinkStatus::Error => "error",
            LinkStatus::Syncing => "syncing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarLink {
    pub id: Ulid,
    pub property_id: Ulid,
    pub url: String,
    pub direction: LinkDirection,
    pub policy: ConflictPolicy,
    pub status: LinkStatus,
    pub last_sync: Option<Ms>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub next_attempt_at: Ms,
    /// Nights covered by the feed as of the last successful import.
    pub imported: BTreeSet<NaiveDate>,
}

/// One event of a remote feed, reduced to the nights it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalBlock {
    pub uid: Option<String>,
    pub range: DateRange,
}

// ── WAL records ──────────────────────────────────────────────────

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PropertyCreated {
        property: Property,
    },
    PropertyUpdated {
        property: Property,
    },
    PropertyDeleted {
        id: Ulid,
    },
    RuleAdded {
        rule: PricingRule,
    },
    RuleRemoved {
        id: Ulid,
        property_id: Ulid,
    },
    BlockAdded {
        id: Ulid,
        property_id: Ulid,
        range: DateRange,
    },
    BlockRemoved {
        id: Ulid,
        property_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingTransitioned {
        id: Ulid,
        property_id: Ulid,
        to: BookingStatus,
        at: Ms,
        reason: Option<CancelReason>,
        reference: Option<String>,
    },
    LinkAdded {
        link: CalendarLink,
    },
    LinkRemoved {
        id: Ulid,
        property_id: Ulid,
        /// Manual blocks that take over the nights this link had blocked.
        retained: Vec<Block>,
    },
    ImportApplied {
        link_id: Ulid,
        property_id: Ulid,
        added: Vec<DateRange>,
        removed: Vec<DateRange>,
        at: Ms,
        next_attempt_at: Ms,
    },
    LinkFailed {
        link_id: Ulid,
        property_id: Ulid,
        error: String,
        failures: u32,
        next_attempt_at: Ms,
    },
}

impl Event {
    /// Property the event belongs to.
    pub fn property_id(&self) -> Ulid {
        match self {
            Event::PropertyCreated { property } | Event::PropertyUpdated { property } => property.id,
            Event::PropertyDeleted { id } => *id,
            Event::RuleAdded { rule } => rule.property_id,
            Event::BookingCreated { booking } => booking.property_id,
            Event::LinkAdded { link } => link.property_id,
            Event::RuleRemoved { property_id, .. }
            | Event::BlockAdded { property_id, .. }
            | Event::BlockRemoved { property_id, .. }
            | Event::BookingTransitioned { property_id, .. }
            | Event::LinkRemoved { property_id, .. }
            | Event::ImportApplied { property_id, .. }
            | Event::LinkFailed { property_id, .. } => *property_id,
        }
    }
}
