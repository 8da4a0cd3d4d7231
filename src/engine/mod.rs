mod admission;
mod cancellation;
mod catalog;
mod error;
mod fairness;
mod overlap;
mod payments;
mod queries;

pub use admission::{Admission, ReservationRequest};
pub use payments::PaymentSubmission;
pub use error::{BookingError, ErrorKind};
pub use fairness::consecutive_stay_days;
pub use overlap::first_conflict;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::limits::Policy;
use crate::model::*;
use crate::notify::Notifier;
use crate::wal::Wal;

/// Everything stored about one unit. One lock guards the whole document set,
/// so a transaction touching the unit, its reservations and its payments is
/// atomic with respect to every other reader and writer of that unit.
#[derive(Debug, Clone)]
pub struct UnitState {
    pub unit: RentalUnit,
    /// Sorted by `range.start`.
    pub reservations: Vec<Reservation>,
    pub payments: Vec<Payment>,
    /// Arrival order.
    pub queue: Vec<QueueEntry>,
    pub audit: Vec<AuditEntry>,
}

impl UnitState {
    pub fn new(unit: RentalUnit) -> Self {
        Self {
            unit,
            reservations: Vec::new(),
            payments: Vec::new(),
            queue: Vec::new(),
            audit: Vec::new(),
        }
    }

    /// Insert keeping sort order by start day.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.range.start <= reservation.range.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn payment(&self, id: &Ulid) -> Option<&Payment> {
        self.payments.iter().find(|p| p.id == *id)
    }

    pub fn payment_for_reservation(&self, reservation_id: &Ulid) -> Option<&Payment> {
        self.payments.iter().find(|p| p.reservation_id == *reservation_id)
    }

    /// 1-based queue position of a user, if queued.
    pub fn queue_position(&self, user_id: &Ulid) -> Option<usize> {
        self.queue.iter().position(|q| q.user_id == *user_id).map(|i| i + 1)
    }

    /// Reservations (any status) whose range intersects `query`.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.range.start <= query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.range.end >= query.start)
    }
}

pub type SharedUnitState = Arc<RwLock<UnitState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task owning the WAL. Appends that queue up while a flush is in
/// progress are written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { commit, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(commit, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(commit, _)| wal.append_buffered(commit));
    // Flush even after an append error so half-buffered bytes from this
    // batch never leak into the next one.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed to control path")));
        }
    }
}

/// Apply one event to its unit. Caller holds the unit's write lock.
fn apply_to_unit(us: &mut UnitState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::UnitRegistered { unit } => {
            us.unit = unit.clone();
        }
        Event::UnitStatusChanged {
            status,
            reserved_to,
            reservation_expires_at,
            ..
        } => {
            us.unit.status = *status;
            us.unit.reserved_to = *reserved_to;
            us.unit.reservation_expires_at = *reservation_expires_at;
        }
        Event::ReservationCreated { reservation } => {
            entity_map.insert(reservation.id, reservation.unit_id);
            us.insert_reservation(reservation.clone());
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = us.reservations.iter_mut().find(|r| r.id == *id) {
                r.status = *status;
            }
        }
        Event::QueueJoined { entry } => {
            if us.queue_position(&entry.user_id).is_none() {
                us.queue.push(entry.clone());
            }
        }
        Event::QueueLeft { user_id, .. } => {
            us.queue.retain(|q| q.user_id != *user_id);
        }
        Event::PaymentSubmitted { unit_id, payment } => {
            entity_map.insert(payment.id, *unit_id);
            match us.payments.iter_mut().find(|p| p.id == payment.id) {
                Some(existing) => *existing = payment.clone(),
                None => us.payments.push(payment.clone()),
            }
        }
        Event::PaymentVerified {
            id,
            status,
            verified_by,
            verified_at,
            rejection_reason,
            ..
        } => {
            if let Some(p) = us.payments.iter_mut().find(|p| p.id == *id) {
                p.status = *status;
                p.verified_by = Some(*verified_by);
                p.verified_at = Some(*verified_at);
                p.rejection_reason = rejection_reason.clone();
            }
        }
        Event::AuditRecorded { entry, .. } => {
            us.audit.push(entry.clone());
        }
    }
}

pub struct Engine {
    pub(super) units: DashMap<Ulid, SharedUnitState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation/payment id → unit id.
    pub(super) entity_to_unit: DashMap<Ulid, Ulid>,
    /// Serializes unit registration against compaction snapshots.
    pub(super) catalog_lock: Mutex<()>,
    pub(super) notifier: Notifier,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: Policy,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        policy: Policy,
    ) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            units: DashMap::new(),
            wal_tx,
            entity_to_unit: DashMap::new(),
            catalog_lock: Mutex::new(()),
            notifier,
            clock,
            policy,
        };

        // Sole owner of every Arc here, so try_write never contends. Never
        // block_on/blocking_write: this may run inside an async context.
        for event in commits.iter().flat_map(|c| c.events.iter()) {
            if let Event::UnitRegistered { unit } = event
                && !engine.units.contains_key(&unit.id)
            {
                let state = UnitState::new(unit.clone());
                engine.units.insert(unit.id, Arc::new(RwLock::new(state)));
                continue;
            }
            if let Some(shared) = engine.get_unit_state(&event.unit_id())
                && let Ok(mut guard) = shared.try_write()
            {
                apply_to_unit(&mut guard, event, &engine.entity_to_unit);
            }
        }

        tracing::info!(
            "replayed {} commits, {} units loaded",
            commits.len(),
            engine.units.len()
        );
        Ok(engine)
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Durably append one transaction via the group-commit writer.
    async fn wal_append(&self, commit: Commit) -> Result<(), BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| BookingError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Transient(e.to_string()))
    }

    /// Commit a transaction against a unit the caller holds write-locked:
    /// log first, then apply. If the log write fails nothing is applied.
    pub(super) async fn commit(&self, us: &mut UnitState, events: Vec<Event>) -> Result<(), BookingError> {
        debug_assert!(events.iter().all(|e| e.unit_id() == us.unit.id));
        let commit = Commit { events };
        self.wal_append(commit.clone()).await?;
        for event in &commit.events {
            apply_to_unit(us, event, &self.entity_to_unit);
        }
        Ok(())
    }

    pub fn get_unit_state(&self, id: &Ulid) -> Option<SharedUnitState> {
        self.units.get(id).map(|e| e.value().clone())
    }

    pub fn get_unit_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_unit.get(entity_id).map(|e| *e.value())
    }

    /// Lookup entity → unit, acquire the unit's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
        not_found: impl Fn() -> BookingError,
    ) -> Result<OwnedRwLockWriteGuard<UnitState>, BookingError> {
        let unit_id = self.get_unit_for_entity(entity_id).ok_or_else(&not_found)?;
        let shared = self.get_unit_state(&unit_id).ok_or_else(&not_found)?;
        Ok(shared.write_owned().await)
    }

    /// Rewrite the WAL as one snapshot commit per unit.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut unit_ids: Vec<Ulid> = self.units.iter().map(|e| *e.key()).collect();
        unit_ids.sort();

        // Read guards stay held until the swap completes so no commit can
        // land in the old file after its unit was snapshotted.
        let mut guards = Vec::with_capacity(unit_ids.len());
        for id in &unit_ids {
            if let Some(shared) = self.get_unit_state(id) {
                guards.push(shared.read_owned().await);
            }
        }
        let snapshot: Vec<Commit> = guards.iter().map(|g| snapshot_unit(g)).collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| BookingError::Transient("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| BookingError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Transient(e.to_string()));
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

/// Minimal events recreating one unit's current documents.
fn snapshot_unit(us: &UnitState) -> Commit {
    let unit_id = us.unit.id;
    let mut events = vec![Event::UnitRegistered { unit: us.unit.clone() }];
    events.extend(
        us.reservations
            .iter()
            .map(|r| Event::ReservationCreated { reservation: r.clone() }),
    );
    events.extend(us.payments.iter().map(|p| Event::PaymentSubmitted {
        unit_id,
        payment: p.clone(),
    }));
    events.extend(us.queue.iter().map(|q| Event::QueueJoined { entry: q.clone() }));
    events.extend(us.audit.iter().map(|a| Event::AuditRecorded {
        unit_id,
        entry: a.clone(),
    }));
    Commit { events }
}
