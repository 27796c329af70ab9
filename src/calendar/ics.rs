use std::fmt::Write;

use chrono::{DateTime, NaiveDate};
use ulid::Ulid;

use crate::limits::MAX_FEED_EVENTS;
use crate::model::{DateRange, ExternalBlock, Ms};

use super::CalendarError;

/// Undo RFC 5545 line folding: a line starting with a space or tab continues the previous one.
fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix([' ', '\t'])
            && let Some(last) = lines.last_mut()
        {
            last.push_str(rest);
            continue;
        }
        lines.push(raw.to_string());
    }
    lines
}

/// Split `NAME;PARAM=x:VALUE` into the upper-cased name and the value.
fn split_property(line: &str) -> Option<(String, &str)> {
    let (head, value) = line.split_once(':')?;
    let name = head.split(';').next().unwrap_or(head);
    Some((name.trim().to_ascii_uppercase(), value.trim()))
}

/// DATE (`20260810`) or DATE-TIME (`20260810T140000Z`); only the date part matters.
fn parse_date(value: &str) -> Result<NaiveDate, CalendarError> {
    value
        .get(..8)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok())
        .ok_or_else(|| CalendarError::Malformed(format!("unparsable date {value:?}")))
}

#[derive(Default)]
struct PendingEvent {
    uid: Option<String>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

/// Parse the all-day and timed `VEVENT`s of an iCalendar document into the
/// nights they occupy. A missing `DTEND`, or one not after `DTSTART`, means a
/// single night. Everything besides `VEVENT`s is ignored.
pub fn parse_feed(text: &str) -> Result<Vec<ExternalBlock>, CalendarError> {
    let lines = unfold(text);
    if !lines
        .iter()
        .any(|l| l.trim().eq_ignore_ascii_case("BEGIN:VCALENDAR"))
    {
        return Err(CalendarError::Malformed("missing BEGIN:VCALENDAR".into()));
    }

    let mut blocks = Vec::new();
    let mut current: Option<PendingEvent> = None;
    for line in &lines {
        let Some((name, value)) = split_property(line) else { continue };
        let is_vevent = value.eq_ignore_ascii_case("VEVENT");
        if name == "BEGIN" && is_vevent {
            current = Some(PendingEvent::default());
            continue;
        }
        if name == "END" && is_vevent {
            if let Some(event) = current.take() {
                let start = event
                    .start
                    .ok_or_else(|| CalendarError::Malformed("VEVENT without DTSTART".into()))?;
                let end = event
                    .end
                    .filter(|end| *end > start)
                    .or_else(|| start.succ_opt())
                    .ok_or_else(|| CalendarError::Malformed("date out of range".into()))?;
                if blocks.len() == MAX_FEED_EVENTS {
                    return Err(CalendarError::Malformed("too many events".into()));
                }
                blocks.push(ExternalBlock {
                    uid: event.uid,
                    range: DateRange::new(start, end),
                });
            }
            continue;
        }
        let Some(event) = current.as_mut() else { continue };
        match name.as_str() {
            "DTSTART" => event.start = Some(parse_date(value)?),
            "DTEND" => event.end = Some(parse_date(value)?),
            "UID" => event.uid = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(blocks)
}

/// Render unavailable ranges as an iCalendar feed of all-day events.
pub fn export_feed(property_id: Ulid, ranges: &[DateRange], stamp: Ms) -> String {
    let dtstamp = DateTime::from_timestamp_millis(stamp)
        .unwrap_or_default()
        .format("%Y%m%dT%H%M%SZ")
        .to_string();

    let mut out = String::new();
    out.push_str("BEGIN:VCALENDAR\r\n");
    out.push_str("VERSION:2.0\r\n");
    out.push_str("PRODID:-//innkeep//availability//EN\r\n");
    out.push_str("CALSCALE:GREGORIAN\r\n");
    for range in ranges {
        let start = range.start.format("%Y%m%d");
        let end = range.end.format("%Y%m%d");
        // Writing into a String cannot fail.
        let _ = write!(
            out,
            "BEGIN:VEVENT\r\n\
             UID:{property_id}-{start}@innkeep\r\n\
             DTSTAMP:{dtstamp}\r\n\
             DTSTART;VALUE=DATE:{start}\r\n\
             DTEND;VALUE=DATE:{end}\r\n\
             SUMMARY:Not available\r\n\
             END:VEVENT\r\n"
        );
    }
    out.push_str("END:VCALENDAR\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn r(a: &str, b: &str) -> DateRange {
        DateRange::new(d(a), d(b))
    }

    #[test]
    fn parses_all_day_and_timed_events() {
        let feed = "BEGIN:VCALENDAR\r\n\
                    VERSION:2.0\r\n\
                    BEGIN:VEVENT\r\n\
                    UID:abc@airbnb\r\n\
                    DTSTART;VALUE=DATE:20260810\r\n\
                    DTEND;VALUE=DATE:20260813\r\n\
                    SUMMARY:Reserved\r\n\
                    END:VEVENT\r\n\
                    BEGIN:VEVENT\r\n\
                    DTSTART:20260901T150000Z\r\n\
                    DTEND:20260903T100000Z\r\n\
                    END:VEVENT\r\n\
                    END:VCALENDAR\r\n";
        let blocks = parse_feed(feed).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].uid.as_deref(), Some("abc@airbnb"));
        assert_eq!(blocks[0].range, r("2026-08-10", "2026-08-13"));
        assert_eq!(blocks[1].uid, None);
        assert_eq!(blocks[1].range, r("2026-09-01", "2026-09-03"));
    }

    #[test]
    fn missing_dtend_is_one_night() {
        let feed = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nDTSTART;VALUE=DATE:20261224\nEND:VEVENT\nEND:VCALENDAR\n";
        let blocks = parse_feed(feed).unwrap();
        assert_eq!(blocks[0].range, r("2026-12-24", "2026-12-25"));
    }

    #[test]
    fn dtend_equal_to_start_is_one_night() {
        let feed = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nDTSTART:20261224\nDTEND:20261224\nEND:VEVENT\nEND:VCALENDAR\n";
        assert_eq!(parse_feed(feed).unwrap()[0].range, r("2026-12-24", "2026-12-25"));
    }

    #[test]
    fn folded_lines_are_joined() {
        let feed = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:very-long-\r\n identifier\r\nDTSTART;VALUE=DATE:2026\r\n 0810\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let blocks = parse_feed(feed).unwrap();
        assert_eq!(blocks[0].uid.as_deref(), Some("very-long-identifier"));
        assert_eq!(blocks[0].range.start, d("2026-08-10"));
    }

    #[test]
    fn rejects_non_calendar_and_bad_dates() {
        assert!(matches!(parse_feed("<html>login</html>"), Err(CalendarError::Malformed(_))));
        let bad = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nDTSTART:2026-08-10\nEND:VEVENT\nEND:VCALENDAR\n";
        assert!(matches!(parse_feed(bad), Err(CalendarError::Malformed(_))));
        let no_start = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:x\nEND:VEVENT\nEND:VCALENDAR\n";
        assert!(matches!(parse_feed(no_start), Err(CalendarError::Malformed(_))));
    }

    #[test]
    fn event_count_is_capped() {
        let feed = |events: usize| {
            let mut text = String::from("BEGIN:VCALENDAR\n");
            for _ in 0..events {
                text.push_str("BEGIN:VEVENT\nDTSTART;VALUE=DATE:20260810\nEND:VEVENT\n");
            }
            text.push_str("END:VCALENDAR\n");
            text
        };
        assert_eq!(parse_feed(&feed(MAX_FEED_EVENTS)).unwrap().len(), MAX_FEED_EVENTS);
        assert!(matches!(parse_feed(&feed(MAX_FEED_EVENTS + 1)), Err(CalendarError::Malformed(_))));
    }

    #[test]
    fn empty_calendar_has_no_blocks() {
        let feed = "BEGIN:VCALENDAR\nVERSION:2.0\nBEGIN:VTIMEZONE\nTZID:Europe/Lisbon\nEND:VTIMEZONE\nEND:VCALENDAR\n";
        assert!(parse_feed(feed).unwrap().is_empty());
    }

    #[test]
    fn export_then_parse_gives_same_ranges() {
        let ranges = vec![r("2026-08-10", "2026-08-12"), r("2026-08-20", "2026-08-27")];
        let feed = export_feed(Ulid::new(), &ranges, 1_780_000_000_000);
        assert!(feed.starts_with("BEGIN:VCALENDAR\r\n"));
        assert!(feed.ends_with("END:VCALENDAR\r\n"));
        assert!(feed.contains("DTSTART;VALUE=DATE:20260810\r\n"));
        let parsed: Vec<DateRange> = parse_feed(&feed).unwrap().into_iter().map(|b| b.range).collect();
        assert_eq!(parsed, ranges);
    }
}
