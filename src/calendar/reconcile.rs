use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::engine::PropertyState;
use crate::model::{CalendarLink, DateRange, ExternalBlock, SlotSource};

/// What one import changes on a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportPlan {
    /// Nights newly covered by the feed.
    pub added: Vec<DateRange>,
    /// Nights the feed no longer covers.
    pub removed: Vec<DateRange>,
    /// Newly covered nights that a local booking already holds. The booking keeps them.
    pub conflicts: Vec<DateRange>,
}

impl ImportPlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Nights covered by the feed's events, clipped to `window`.
pub fn remote_dates(blocks: &[ExternalBlock], window: &DateRange) -> BTreeSet<NaiveDate> {
    blocks
        .iter()
        .filter_map(|b| b.range.intersection(window))
        .flat_map(|r| r.dates())
        .collect()
}

/// Diff the feed against what the link imported last time.
///
/// Only nights inside `window` are compared, so past nights the feed has
/// dropped are not reported as removals.
pub fn plan_import(
    ps: &PropertyState,
    link: &CalendarLink,
    remote: &BTreeSet<NaiveDate>,
    window: &DateRange,
) -> ImportPlan {
    let added: Vec<NaiveDate> = remote.difference(&link.imported).copied().collect();
    let removed = link
        .imported
        .range(window.start..window.end)
        .filter(|d| !remote.contains(d))
        .copied();
    let conflicts = added
        .iter()
        .filter(|d| matches!(ps.slot(**d).source, SlotSource::Booking(_)))
        .copied();

    ImportPlan {
        conflicts: DateRange::from_dates(conflicts),
        added: DateRange::from_dates(added),
        removed: DateRange::from_dates(removed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use rust_decimal::Decimal;
    use ulid::Ulid;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn r(a: &str, b: &str) -> DateRange {
        DateRange::new(d(a), d(b))
    }

    fn link(property_id: Ulid, imported: &[DateRange]) -> CalendarLink {
        CalendarLink {
            id: Ulid::new(),
            property_id,
            url: "https://example.test/a.ics".into(),
            direction: LinkDirection::Import,
            policy: ConflictPolicy::Block,
            status: LinkStatus::Connected,
            last_sync: None,
            last_error: None,
            consecutive_failures: 0,
            next_attempt_at: 0,
            imported: imported.iter().flat_map(|r| r.dates()).collect(),
        }
    }

    fn block(range: DateRange) -> ExternalBlock {
        ExternalBlock { uid: None, range }
    }

    #[test]
    fn remote_dates_clip_to_window() {
        let window = r("2026-08-01", "2026-09-01");
        let dates = remote_dates(&[block(r("2026-07-30", "2026-08-02")), block(r("2026-08-31", "2026-09-04"))], &window);
        assert_eq!(
            dates.into_iter().collect::<Vec<_>>(),
            vec![d("2026-08-01"), d("2026-08-31")]
        );
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let ps = PropertyState::new(Property::new(Ulid::new(), "o", 2, Decimal::from(50)));
        let window = r("2026-08-01", "2027-08-01");
        let l = link(ps.property.id, &[r("2026-08-10", "2026-08-13")]);
        let remote = remote_dates(&[block(r("2026-08-12", "2026-08-15"))], &window);

        let plan = plan_import(&ps, &l, &remote, &window);
        assert_eq!(plan.added, vec![r("2026-08-13", "2026-08-15")]);
        assert_eq!(plan.removed, vec![r("2026-08-10", "2026-08-12")]);
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn unchanged_feed_plans_nothing() {
        let ps = PropertyState::new(Property::new(Ulid::new(), "o", 2, Decimal::from(50)));
        let window = r("2026-08-01", "2027-08-01");
        let l = link(ps.property.id, &[r("2026-08-10", "2026-08-13")]);
        let remote = remote_dates(&[block(r("2026-08-10", "2026-08-13"))], &window);
        assert!(plan_import(&ps, &l, &remote, &window).is_empty());
    }

    #[test]
    fn past_nights_are_not_removed() {
        let ps = PropertyState::new(Property::new(Ulid::new(), "o", 2, Decimal::from(50)));
        let window = r("2026-08-20", "2027-08-01");
        let l = link(ps.property.id, &[r("2026-08-10", "2026-08-13")]);
        let plan = plan_import(&ps, &l, &BTreeSet::new(), &window);
        assert!(plan.removed.is_empty());
    }
}
