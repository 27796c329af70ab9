mod approval;
mod conflict;
mod error;
mod mutations;
mod pricing;
mod queries;
mod store;
mod sync;

pub use approval::initial_status;
pub use conflict::{blocking_bookings, check_bookable, overlaps, stay_range};
pub use error::EngineError;
pub use mutations::{BookingOutcome, BookingRequest, TransitionOutcome};
pub use pricing::{nightly_rate, price};
pub use store::PropertyState;
pub use sync::SyncReport;

pub(crate) use conflict::now_ms;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Commit what we have before compacting or reporting.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal<Event>, batch: &mut Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal<Event>, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedPropertyState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
    /// Reverse lookup: booking/rule/block/link id → property id.
    pub(super) entity_to_property: DashMap<Ulid, Ulid>,
    /// Idempotency key → booking id.
    pub(super) idempotency: DashMap<String, Ulid>,
    /// Keys with booking attempts in flight → (target property, attempt count).
    pub(super) key_claims: DashMap<String, (Ulid, usize)>,
}

/// Keep the reverse lookups in step with a committed event.
fn index_event(
    event: &Event,
    entity_to_property: &DashMap<Ulid, Ulid>,
    idempotency: &DashMap<String, Ulid>,
) {
    match event {
        Event::RuleAdded { rule } => {
            entity_to_property.insert(rule.id, rule.property_id);
        }
        Event::BlockAdded { id, property_id, .. } => {
            entity_to_property.insert(*id, *property_id);
        }
        Event::BookingCreated { booking } => {
            entity_to_property.insert(booking.id, booking.property_id);
            idempotency.insert(booking.idempotency_key.clone(), booking.id);
        }
        Event::LinkAdded { link } => {
            entity_to_property.insert(link.id, link.property_id);
        }
        Event::LinkRemoved { id, property_id, retained } => {
            entity_to_property.remove(id);
            for block in retained {
                entity_to_property.insert(block.id, *property_id);
            }
        }
        Event::RuleRemoved { id, .. } | Event::BlockRemoved { id, .. } => {
            entity_to_property.remove(id);
        }
        Event::PropertyCreated { .. }
        | Event::PropertyUpdated { .. }
        | Event::PropertyDeleted { .. }
        | Event::BookingTransitioned { .. }
        | Event::ImportApplied { .. }
        | Event::LinkFailed { .. } => {}
    }
}

/// Drop the index entries of a property that is going away.
fn unindex_property(ps: &PropertyState, entity_to_property: &DashMap<Ulid, Ulid>) {
    let ids = ps
        .rules
        .iter()
        .map(|r| r.id)
        .chain(ps.blocks.iter().map(|b| b.id))
        .chain(ps.links.iter().map(|l| l.id))
        .chain(ps.bookings.iter().map(|b| b.id));
    for id in ids {
        entity_to_property.remove(&id);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::<Event>::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_property = DashMap::new();
        let idempotency = DashMap::new();

        // Replay into plain values first; nothing else can see them yet.
        let mut properties: HashMap<Ulid, PropertyState> = HashMap::new();
        for event in &events {
            match event {
                Event::PropertyCreated { property } => {
                    properties.insert(property.id, PropertyState::new(property.clone()));
                }
                Event::PropertyDeleted { id } => {
                    if let Some(ps) = properties.remove(id) {
                        unindex_property(&ps, &entity_to_property);
                    }
                }
                other => {
                    if let Some(ps) = properties.get_mut(&other.property_id()) {
                        ps.apply(other);
                        index_event(other, &entity_to_property, &idempotency);
                    }
                }
            }
        }
        tracing::info!(
            "replayed {} events into {} properties from {}",
            events.len(),
            properties.len(),
            wal_path.display()
        );

        let state = properties
            .into_iter()
            .map(|(id, ps)| (id, Arc::new(RwLock::new(ps))))
            .collect();

        Ok(Self {
            state,
            wal_tx,
            notify,
            config,
            entity_to_property,
            idempotency,
            key_claims: DashMap::new(),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_property_state(&self, id: &Ulid) -> Option<SharedPropertyState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_property_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_property.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify. The caller holds the property's write lock,
    /// so a failed append leaves memory untouched.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut PropertyState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        ps.apply(event);
        index_event(event, &self.entity_to_property, &self.idempotency);
        self.notify.changed(event.property_id(), event);
        Ok(())
    }

    /// Acquire a property's write lock, waiting at most `request_timeout`.
    pub(super) async fn write_property(
        &self,
        property_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<PropertyState>, EngineError> {
        let ps = self
            .get_property_state(property_id)
            .ok_or(EngineError::NotFound(*property_id))?;
        let wait = Instant::now();
        let guard = tokio::time::timeout(self.config.request_timeout, ps.write_owned())
            .await
            .map_err(|_| {
                tracing::warn!("lock wait on property {property_id} exceeded {:?}", self.config.request_timeout);
                EngineError::Timeout
            })?;
        metrics::histogram!(observability::LOCK_WAIT_SECONDS).record(wait.elapsed().as_secs_f64());
        Ok(guard)
    }

    /// Lookup entity → property, acquire the property's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<PropertyState>), EngineError> {
        let property_id = self
            .get_property_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.write_property(&property_id).await?;
        Ok((property_id, guard))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let properties: Vec<SharedPropertyState> = self.state.iter().map(|e| e.value().clone()).collect();
        // Read guards stay held until the swap so no mutation lands in the old file only.
        let mut guards = Vec::with_capacity(properties.len());
        let mut events = Vec::new();
        for ps in properties {
            let guard = ps.read_owned().await;
            events.extend(guard.snapshot_events());
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
