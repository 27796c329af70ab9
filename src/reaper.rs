use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::calendar::FeedFetcher;
use crate::engine::{Engine, now_ms};

/// Periodically cancel `pending_payment` bookings whose deadline has passed.
pub async fn run_payment_reaper(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let expired = engine.expire_pending_payments(now_ms()).await;
        for id in &expired {
            info!("booking {id} cancelled: payment not received in time");
        }
    }
    tracing::debug!("payment reaper stopped");
}

/// Rewrite the WAL once enough appends have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
    tracing::debug!("compactor stopped");
}

/// Poll import links that are due and sync them concurrently. A slow or broken
/// feed only delays its own link.
pub async fn run_calendar_sync(
    engine: Arc<Engine>,
    fetcher: Arc<dyn FeedFetcher>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let now = now_ms();
        let due = engine.due_links(now);
        if due.is_empty() {
            continue;
        }
        tracing::debug!("syncing {} calendar links", due.len());
        let syncs = due.into_iter().map(|link_id| {
            let engine = engine.clone();
            let fetcher = fetcher.clone();
            async move {
                match engine.sync_import(link_id, fetcher.as_ref(), now).await {
                    Ok(report) if !report.errors.is_empty() => {
                        tracing::debug!("link {link_id} sync failed: {}", report.errors.join("; "));
                    }
                    Ok(_) => {}
                    // Link removed or property busy; the next poll retries.
                    Err(e) => tracing::debug!("link {link_id} skipped: {e}"),
                }
            }
        });
        join_all(syncs).await;
    }
    tracing::debug!("calendar sync stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarError;
    use crate::config::EngineConfig;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use async_trait::async_trait;
    use chrono::{Days, NaiveDate};
    use rust_decimal::Decimal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn upcoming(days: u64, nights: u64) -> DateRange {
        let start: NaiveDate = day_of(now_ms()).checked_add_days(Days::new(days)).unwrap();
        DateRange::new(start, start.checked_add_days(Days::new(nights)).unwrap())
    }

    async fn engine_with_property(name: &str, config: EngineConfig) -> (Arc<Engine>, Ulid) {
        let engine = Arc::new(Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), config).unwrap());
        let property = Property::new(Ulid::new(), "owner", 2, Decimal::from(90));
        let pid = property.id;
        engine.create_property(property).await.unwrap();
        (engine, pid)
    }

    #[tokio::test]
    async fn reaper_cancels_overdue_payments() {
        let config = EngineConfig {
            payment_timeout: Duration::ZERO,
            ..EngineConfig::default()
        };
        let (engine, pid) = engine_with_property("reaper_payments.wal", config).await;
        let booking = engine
            .create_booking(
                BookingRequest {
                    property_id: pid,
                    guest: "guest".into(),
                    range: upcoming(10, 2),
                    guests: 1,
                    idempotency_key: "k".into(),
                },
                now_ms(),
            )
            .await
            .unwrap()
            .booking;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_payment_reaper(engine.clone(), Duration::from_millis(10), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        let expired = engine.get_booking(&booking.id).await.unwrap();
        assert_eq!(expired.status, BookingStatus::Cancelled);
        assert_eq!(expired.cancel_reason, Some(CancelReason::PaymentTimeout));
    }

    struct Unreachable;

    #[async_trait]
    impl FeedFetcher for Unreachable {
        async fn fetch(&self, _url: &str) -> Result<String, CalendarError> {
            Err(CalendarError::Unreachable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn calendar_sync_records_failures_and_stops_on_cancel() {
        let (engine, pid) = engine_with_property("reaper_sync.wal", EngineConfig::default()).await;
        let link_id = Ulid::new();
        engine
            .add_calendar_link(
                link_id,
                pid,
                "https://example.test/feed.ics".into(),
                LinkDirection::Import,
                ConflictPolicy::Block,
                "owner",
                now_ms(),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_calendar_sync(
            engine.clone(),
            Arc::new(Unreachable),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        let link = engine.list_calendar_links(pid).await.unwrap().remove(0);
        assert_eq!(link.status, LinkStatus::Error);
        // Backoff keeps the link from being retried on every tick.
        assert_eq!(link.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let (engine, _) = engine_with_property("reaper_compact.wal", EngineConfig::default()).await;
        assert_eq!(engine.wal_appends_since_compact().await, 1);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_compactor(engine.clone(), 1, cancel.clone()));
        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
