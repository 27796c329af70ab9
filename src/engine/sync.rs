use std::collections::BTreeSet;
use std::time::Instant;

use chrono::Days;
use ulid::Ulid;

use crate::calendar::{self, CalendarError, FeedFetcher, ImportPlan};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability;

use super::{Engine, EngineError};

/// Outcome of one import attempt. Fetch and parse failures land in `errors`
/// and on the link; they are not returned as `Err`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<DateRange>,
    pub removed: Vec<DateRange>,
    pub conflicts: Vec<DateRange>,
    pub errors: Vec<String>,
}

impl Engine {
    /// Nights an import may touch: today up to the booking horizon.
    fn sync_window(&self, now: Ms) -> DateRange {
        let today = day_of(now);
        let end = today
            .checked_add_days(Days::new(self.config.horizon_days.max(1) as u64))
            .unwrap_or(chrono::NaiveDate::MAX);
        DateRange::new(today, end)
    }

    fn ms_after(now: Ms, delay: std::time::Duration) -> Ms {
        now.saturating_add(delay.as_millis() as Ms)
    }

    /// Longest a sync can legitimately run: the fetch plus two lock waits.
    fn sync_lease(&self) -> std::time::Duration {
        self.config.sync.fetch_timeout + self.config.request_timeout * 2
    }

    pub async fn add_calendar_link(
        &self,
        id: Ulid,
        property_id: Ulid,
        url: String,
        direction: LinkDirection,
        policy: ConflictPolicy,
        actor: &str,
        now: Ms,
    ) -> Result<CalendarLink, EngineError> {
        if url.len() > MAX_URL_LEN || !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(EngineError::LimitExceeded("calendar url must be http(s) and at most 2048 bytes"));
        }
        if self.entity_to_property.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.write_property(&property_id).await?;
        if guard.property.owner != actor {
            return Err(EngineError::Forbidden("only the property owner can link calendars"));
        }
        if guard.links.len() >= MAX_LINKS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many calendar links on property"));
        }

        let link = CalendarLink {
            id,
            property_id,
            url,
            direction,
            policy,
            status: LinkStatus::Connected,
            last_sync: None,
            last_error: None,
            consecutive_failures: 0,
            next_attempt_at: now,
            imported: BTreeSet::new(),
        };
        let event = Event::LinkAdded { link: link.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("calendar link {id} added to property {property_id} ({}, {})", direction.as_str(), policy.as_str());
        Ok(link)
    }

    /// Unlink a calendar. Without `clear`, nights it had blocked stay blocked as
    /// manual blocks; with `clear` they are released.
    pub async fn remove_calendar_link(&self, id: Ulid, clear: bool, actor: &str) -> Result<Ulid, EngineError> {
        let (property_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.property.owner != actor {
            return Err(EngineError::Forbidden("only the property owner can unlink calendars"));
        }
        if guard.link(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let retained = if clear {
            Vec::new()
        } else {
            let held = guard
                .slots
                .iter()
                .filter(|(_, s)| s.source == SlotSource::External(id))
                .map(|(d, _)| *d);
            DateRange::from_dates(held)
                .into_iter()
                .map(|range| Block { id: Ulid::new(), range })
                .collect()
        };
        let event = Event::LinkRemoved { id, property_id, retained };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("calendar link {id} removed from property {property_id}");
        Ok(property_id)
    }

    /// Import links that are due: importing direction and past `next_attempt_at`.
    /// A link mid-sync holds a lease in `next_attempt_at`, so it comes due again
    /// only if that sync never finished. Contended properties are skipped until
    /// the next poll.
    pub fn due_links(&self, now: Ms) -> Vec<Ulid> {
        let mut due = Vec::new();
        for entry in self.state.iter() {
            let ps = entry.value().clone();
            if let Ok(guard) = ps.try_read() {
                due.extend(
                    guard
                        .links
                        .iter()
                        .filter(|l| {
                            l.direction.imports() && l.next_attempt_at <= now
                        })
                        .map(|l| l.id),
                );
            }
        }
        due
    }

    /// Pull one link's feed and merge it into the property's calendar.
    ///
    /// The fetch runs without any lock. The diff and write happen in a single
    /// critical section, so a booking committed meanwhile is seen and kept.
    pub async fn sync_import(
        &self,
        link_id: Ulid,
        fetcher: &dyn FeedFetcher,
        now: Ms,
    ) -> Result<SyncReport, EngineError> {
        let started = Instant::now();
        let url = {
            let (_, mut guard) = self.resolve_entity_write(&link_id).await?;
            let link = guard.link_mut(&link_id).ok_or(EngineError::NotFound(link_id))?;
            if !link.direction.imports() {
                return Ok(SyncReport::default());
            }
            link.status = LinkStatus::Syncing;
            link.next_attempt_at = Self::ms_after(now, self.sync_lease());
            link.url.clone()
        };

        let fetched = match tokio::time::timeout(self.config.sync.fetch_timeout, fetcher.fetch(&url)).await {
            Ok(result) => result,
            Err(_) => Err(CalendarError::Unreachable("fetch timed out".into())),
        };
        let result = match fetched.and_then(|text| calendar::parse_feed(&text)) {
            Ok(blocks) => self.apply_import(link_id, &blocks, now).await,
            Err(e) => self.record_sync_failure(link_id, e, now).await,
        };
        // Nothing was committed; don't leave the link stuck in `syncing`.
        if result.is_err()
            && let Ok((_, mut guard)) = self.resolve_entity_write(&link_id).await
            && let Some(link) = guard.link_mut(&link_id)
            && link.status == LinkStatus::Syncing
        {
            link.status = LinkStatus::Error;
        }

        let status = match &result {
            Ok(report) if report.errors.is_empty() => "ok",
            _ => "error",
        };
        metrics::counter!(observability::CALENDAR_SYNCS_TOTAL, "status" => status).increment(1);
        metrics::histogram!(observability::CALENDAR_SYNC_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn apply_import(
        &self,
        link_id: Ulid,
        blocks: &[ExternalBlock],
        now: Ms,
    ) -> Result<SyncReport, EngineError> {
        let window = self.sync_window(now);
        let remote = calendar::remote_dates(blocks, &window);

        let (property_id, mut guard) = self.resolve_entity_write(&link_id).await?;
        let link = guard.link(&link_id).ok_or(EngineError::NotFound(link_id))?;
        let policy = link.policy;
        let ImportPlan { added, removed, conflicts } = calendar::plan_import(&guard, link, &remote, &window);

        let event = Event::ImportApplied {
            link_id,
            property_id,
            added: added.clone(),
            removed: removed.clone(),
            at: now,
            next_attempt_at: Self::ms_after(now, self.config.sync.interval),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        for range in &conflicts {
            match policy {
                ConflictPolicy::Notify => {
                    tracing::warn!("external calendar {link_id} overlaps a local booking on {range}");
                    self.notify
                        .send(property_id, Notification::ExternalOverlap { link_id, range: *range });
                }
                ConflictPolicy::Block | ConflictPolicy::Ignore => {
                    tracing::info!("external calendar {link_id} covers {range}; local booking keeps it");
                }
            }
        }
        tracing::debug!(
            "link {link_id}: {} ranges added, {} removed, {} conflicting",
            added.len(),
            removed.len(),
            conflicts.len()
        );

        Ok(SyncReport {
            added,
            removed,
            conflicts,
            errors: Vec::new(),
        })
    }

    async fn record_sync_failure(
        &self,
        link_id: Ulid,
        error: CalendarError,
        now: Ms,
    ) -> Result<SyncReport, EngineError> {
        let (property_id, mut guard) = self.resolve_entity_write(&link_id).await?;
        let link = guard.link(&link_id).ok_or(EngineError::NotFound(link_id))?;
        let failures = link.consecutive_failures.saturating_add(1);
        let retry_in = self.config.sync.backoff(failures);
        tracing::warn!("calendar link {link_id} failed ({failures} in a row), retrying in {retry_in:?}: {error}");

        let event = Event::LinkFailed {
            link_id,
            property_id,
            error: error.to_string(),
            failures,
            next_attempt_at: Self::ms_after(now, retry_in),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(SyncReport {
            errors: vec![error.to_string()],
            ..SyncReport::default()
        })
    }

    /// The property's unavailable nights as an iCalendar feed: bookings
    /// (confirmed or pending) and manual blocks. Imported nights are left out
    /// so linked calendars do not echo each other.
    pub async fn export_feed(&self, property_id: Ulid, now: Ms) -> Result<String, EngineError> {
        let ps = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        let taken = guard
            .slots
            .iter()
            .filter(|(_, s)| {
                matches!(s.status, SlotStatus::Booked | SlotStatus::Pending) || s.source == SlotSource::Manual
            })
            .map(|(d, _)| *d);
        let ranges = DateRange::from_dates(taken);
        Ok(calendar::export_feed(property_id, &ranges, now))
    }
}
