use chrono::{Datelike, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::PricingConfig;
use crate::limits::MAX_AMOUNT;
use crate::model::*;

fn round(amount: Decimal, minor_units: u32) -> Decimal {
    amount.round_dp_with_strategy(minor_units, RoundingStrategy::MidpointAwayFromZero)
}

/// Higher priority first; equal priorities resolve to the lower rule id.
fn by_precedence(a: &&PricingRule, b: &&PricingRule) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then(a.id.cmp(&b.id))
}

/// Effective rate for one night, unrounded.
///
/// An override wins outright. Otherwise a weekend night covered by an uplift
/// gets the uplift added to the base rate. Otherwise every covering percent
/// rule compounds on the base rate in precedence order. The result never
/// exceeds `MAX_AMOUNT`, so stays of any allowed length price without overflow.
pub fn nightly_rate(
    property: &Property,
    rules: &[PricingRule],
    date: NaiveDate,
    weekend_days: &[chrono::Weekday],
) -> NightlyRate {
    let mut covering: Vec<&PricingRule> = rules.iter().filter(|r| r.range.contains(date)).collect();
    covering.sort_by(by_precedence);

    let applied = |rate: Decimal, rule: Option<&PricingRule>| NightlyRate {
        date,
        rate,
        rule_id: rule.map(|r| r.id),
        kind: rule.map(|r| r.kind),
    };

    let ceiling = Decimal::from(MAX_AMOUNT);
    if let Some(rule) = covering.iter().find(|r| r.kind == RuleKind::Override) {
        return applied(rule.value.min(ceiling), Some(*rule));
    }

    if weekend_days.contains(&date.weekday())
        && let Some(rule) = covering.iter().find(|r| r.kind == RuleKind::WeekendUplift)
    {
        let rate = property.base_rate.saturating_add(rule.value).min(ceiling);
        return applied(rate, Some(*rule));
    }

    let hundred = Decimal::ONE_HUNDRED;
    let mut rate = property.base_rate;
    let mut first = None;
    for rule in &covering {
        let factor = match rule.kind {
            RuleKind::SeasonalPercent => Decimal::ONE + rule.value / hundred,
            RuleKind::DiscountPercent => Decimal::ONE - rule.value / hundred,
            RuleKind::Override | RuleKind::WeekendUplift => continue,
        };
        rate = match rate.checked_mul(factor) {
            Some(next) => next.min(ceiling),
            None => ceiling,
        };
        first.get_or_insert(*rule);
    }
    applied(rate.clamp(Decimal::ZERO, ceiling), first)
}

/// Price a stay. Pure: the same property, rules and inputs always give the same breakdown.
///
/// Every component is rounded half away from zero to the currency's minor unit,
/// and `total` is the sum of the rounded components.
pub fn price(
    property: &Property,
    rules: &[PricingRule],
    range: &DateRange,
    guests: u32,
    config: &PricingConfig,
) -> PriceBreakdown {
    let dp = config.minor_units;
    let per_night: Vec<NightlyRate> = range
        .dates()
        .map(|date| {
            let mut night = nightly_rate(property, rules, date, &config.weekend_days);
            night.rate = round(night.rate, dp);
            night
        })
        .collect();

    let nights = per_night.len() as u32;
    let extra_guests = guests.saturating_sub(property.included_guests);
    let ceiling = Decimal::from(MAX_AMOUNT);
    let extra_guest_fee = round(
        property.extra_guest_fee.min(ceiling) * Decimal::from(extra_guests) * Decimal::from(nights),
        dp,
    );
    let subtotal = per_night.iter().map(|n| n.rate).sum::<Decimal>() + extra_guest_fee;
    let cleaning_fee = round(property.cleaning_fee.min(ceiling), dp);
    let service_fee = round(subtotal * config.service_fee_rate, dp);
    let taxes = round((subtotal + cleaning_fee + service_fee) * config.tax_rate, dp);

    PriceBreakdown {
        nights,
        per_night,
        extra_guest_fee,
        subtotal,
        cleaning_fee,
        service_fee,
        taxes,
        total: subtotal + cleaning_fee + service_fee + taxes,
        currency: config.currency.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn r(a: &str, b: &str) -> DateRange {
        DateRange::new(d(a), d(b))
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn property(base: &str) -> Property {
        Property::new(Ulid::new(), "owner", 4, dec(base))
    }

    fn rule(p: &Property, range: DateRange, kind: RuleKind, value: &str, priority: i32) -> PricingRule {
        PricingRule {
            id: Ulid::new(),
            property_id: p.id,
            range,
            kind,
            value: dec(value),
            priority,
        }
    }

    #[test]
    fn weekend_stay_example() {
        // 2026-08-07 is a Friday.
        let mut p = property("1000");
        p.cleaning_fee = dec("150");
        let rules = vec![rule(&p, r("2026-01-01", "2027-01-01"), RuleKind::WeekendUplift, "200", 0)];
        let quote = price(&p, &rules, &r("2026-08-07", "2026-08-09"), 2, &PricingConfig::default());

        assert_eq!(quote.nights, 2);
        assert_eq!(quote.per_night[0].rate, dec("1200"));
        assert_eq!(quote.per_night[1].rate, dec("1200"));
        assert_eq!(quote.subtotal, dec("2400"));
        assert_eq!(quote.cleaning_fee, dec("150"));
        assert_eq!(quote.service_fee, dec("120"));
        assert_eq!(quote.taxes, dec("400.50"));
        assert_eq!(quote.total, dec("3070.50"));
        assert_eq!(quote.total.to_string(), "3070.50");
        assert_eq!(quote.currency, "USD");
    }

    #[test]
    fn uplift_ignores_weekdays() {
        let p = property("1000");
        let rules = vec![rule(&p, r("2026-01-01", "2027-01-01"), RuleKind::WeekendUplift, "200", 0)];
        // Sunday and Monday nights.
        let quote = price(&p, &rules, &r("2026-08-09", "2026-08-11"), 1, &PricingConfig::default());
        assert_eq!(quote.subtotal, dec("2000"));
        assert!(quote.per_night.iter().all(|n| n.rule_id.is_none()));
    }

    #[test]
    fn override_beats_everything_and_ties_go_to_lowest_id() {
        let p = property("100");
        let a = rule(&p, r("2026-08-01", "2026-08-31"), RuleKind::Override, "250", 5);
        let b = rule(&p, r("2026-08-01", "2026-08-31"), RuleKind::Override, "300", 5);
        let low = rule(&p, r("2026-08-01", "2026-08-31"), RuleKind::Override, "50", 1);
        let uplift = rule(&p, r("2026-08-01", "2026-08-31"), RuleKind::WeekendUplift, "999", 9);
        let winner = if a.id < b.id { a.clone() } else { b.clone() };
        let rules = vec![low, b, uplift, a];

        let night = nightly_rate(&p, &rules, d("2026-08-07"), &[chrono::Weekday::Fri]);
        assert_eq!(night.rate, winner.value);
        assert_eq!(night.rule_id, Some(winner.id));
        assert_eq!(night.kind, Some(RuleKind::Override));
    }

    #[test]
    fn percent_rules_compound_in_priority_order() {
        let p = property("200");
        let season = rule(&p, r("2026-07-01", "2026-09-01"), RuleKind::SeasonalPercent, "25", 10);
        let promo = rule(&p, r("2026-08-01", "2026-08-15"), RuleKind::DiscountPercent, "10", 1);
        let rules = vec![promo, season.clone()];

        let night = nightly_rate(&p, &rules, d("2026-08-04"), &[]);
        // 200 * 1.25 * 0.90
        assert_eq!(night.rate, dec("225"));
        assert_eq!(night.rule_id, Some(season.id));

        let outside = nightly_rate(&p, &rules, d("2026-08-20"), &[]);
        assert_eq!(outside.rate, dec("250"));
    }

    #[test]
    fn components_round_half_up() {
        let p = property("33.335");
        let config = PricingConfig {
            service_fee_rate: dec("0.1"),
            tax_rate: dec("0.0"),
            ..PricingConfig::default()
        };
        let quote = price(&p, &[], &r("2026-08-04", "2026-08-05"), 1, &config);
        assert_eq!(quote.per_night[0].rate, dec("33.34"));
        // 33.34 * 0.1 = 3.334
        assert_eq!(quote.service_fee, dec("3.33"));
        assert_eq!(quote.total, dec("36.67"));
    }

    #[test]
    fn extra_guests_pay_per_night() {
        let mut p = property("100");
        p.included_guests = 2;
        p.extra_guest_fee = dec("15");
        let config = PricingConfig {
            service_fee_rate: Decimal::ZERO,
            tax_rate: Decimal::ZERO,
            ..PricingConfig::default()
        };
        let quote = price(&p, &[], &r("2026-08-04", "2026-08-07"), 4, &config);
        assert_eq!(quote.extra_guest_fee, dec("90"));
        assert_eq!(quote.subtotal, dec("390"));

        let within = price(&p, &[], &r("2026-08-04", "2026-08-07"), 2, &config);
        assert_eq!(within.extra_guest_fee, Decimal::ZERO);
    }

    #[test]
    fn pricing_is_deterministic() {
        let mut p = property("180");
        p.cleaning_fee = dec("45.50");
        let rules = vec![
            rule(&p, r("2026-08-01", "2026-09-01"), RuleKind::SeasonalPercent, "12.5", 3),
            rule(&p, r("2026-08-01", "2026-09-01"), RuleKind::WeekendUplift, "40", 1),
        ];
        let stay = r("2026-08-05", "2026-08-12");
        let config = PricingConfig::default();
        assert_eq!(price(&p, &rules, &stay, 3, &config), price(&p, &rules, &stay, 3, &config));
    }

    #[test]
    fn discount_never_goes_negative() {
        let p = property("100");
        let rules = vec![rule(&p, r("2026-08-01", "2026-09-01"), RuleKind::DiscountPercent, "150", 0)];
        assert_eq!(nightly_rate(&p, &rules, d("2026-08-03"), &[]).rate, Decimal::ZERO);
    }

    #[test]
    fn extreme_amounts_price_without_overflow() {
        let mut p = property("1");
        p.base_rate = Decimal::MAX;
        p.cleaning_fee = Decimal::MAX;
        p.extra_guest_fee = Decimal::MAX;
        let quote = price(&p, &[], &r("2026-08-10", "2026-08-12"), 4, &PricingConfig::default());
        assert_eq!(quote.per_night[0].rate, Decimal::from(MAX_AMOUNT));
        assert!(quote.total > Decimal::ZERO);

        // Compounding many surcharges saturates at the ceiling.
        let p = property("900");
        let rules: Vec<PricingRule> = (0..200)
            .map(|i| rule(&p, r("2026-08-01", "2026-09-01"), RuleKind::SeasonalPercent, "1000", i))
            .collect();
        let night = nightly_rate(&p, &rules, d("2026-08-03"), &[]);
        assert_eq!(night.rate, Decimal::from(MAX_AMOUNT));
    }
}
