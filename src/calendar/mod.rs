//! External calendar feeds: iCalendar parsing and export, fetching, and the
//! pure diff that turns a remote feed into slot changes.

pub mod fetch;
pub mod ics;
pub mod reconcile;

pub use fetch::{FeedFetcher, HttpFeedFetcher};
pub use ics::{export_feed, parse_feed};
pub use reconcile::{ImportPlan, plan_import, remote_dates};

use std::fmt;

/// Why an import could not run. Recorded on the link; never reaches booking paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    Unreachable(String),
    Malformed(String),
}

impl fmt::Display for CalendarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarError::Unreachable(why) => write!(f, "feed unreachable: {why}"),
            CalendarError::Malformed(why) => write!(f, "malformed feed: {why}"),
        }
    }
}

impl std::error::Error for CalendarError {}
