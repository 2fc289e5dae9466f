mod access;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use access::can_access;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::{Generator, Ulid};

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use store::BookingIndex;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One fsync for the whole batch, then answer every sender.
/// A non-append command ends the batch; it runs after the batch is durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't bleed into
    // the next batch; every caller in this one is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking engine: room registry, per-room reservation lists and the WAL
/// that makes them durable.
///
/// Each room sits behind its own `RwLock`. Every booking write holds the write
/// lock of the room(s) it touches across conflict check, WAL append and apply,
/// so two writers can never both admit overlapping intervals on one room while
/// writers on different rooms never wait on each other.
pub struct Engine {
    rooms: DashMap<Ulid, SharedRoomState>,
    offices: DashMap<Ulid, OfficeInfo>,
    /// Office → rooms, for cascading deletes.
    office_rooms: DashMap<Ulid, Vec<Ulid>>,
    index: BookingIndex,
    /// Serializes office/room creation, updates and deletion.
    registry_lock: tokio::sync::Mutex<()>,
    ids: Mutex<Generator>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            offices: DashMap::new(),
            office_rooms: DashMap::new(),
            index: BookingIndex::new(),
            registry_lock: tokio::sync::Mutex::new(()),
            ids: Mutex::new(Generator::new()),
            wal_tx,
        };

        for event in &events {
            engine.replay(event);
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            offices = engine.offices.len(),
            rooms = engine.rooms.len(),
            bookings = engine.index.len(),
            "engine state restored"
        );

        Ok(engine)
    }

    /// Rebuild state from one WAL event. We're the sole owner of every room
    /// lock during replay, so `try_write` always succeeds. Never use
    /// `blocking_write` here: this runs inside the runtime.
    fn replay(&self, event: &Event) {
        match event {
            Event::OfficeCreated { id, name, location } => {
                self.offices.insert(
                    *id,
                    OfficeInfo {
                        id: *id,
                        name: name.clone(),
                        location: location.clone(),
                    },
                );
            }
            Event::OfficeUpdated { id, name, location } => {
                if let Some(mut office) = self.offices.get_mut(id) {
                    office.name = name.clone();
                    office.location = location.clone();
                }
            }
            Event::OfficeDeleted { id } => {
                let room_ids = self.office_rooms.get(id).map(|e| e.value().clone()).unwrap_or_default();
                for room_id in room_ids {
                    if let Some(rs) = self.room_state(&room_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        self.detach_room(&mut guard);
                    }
                }
                self.office_rooms.remove(id);
                self.offices.remove(id);
            }
            Event::RoomCreated { id, office_id, name, capacity } => {
                self.attach_room(RoomState::new(*id, *office_id, name.clone(), *capacity));
            }
            Event::RoomDeleted { id } => {
                if let Some(rs) = self.room_state(id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    self.detach_room(&mut guard);
                }
            }
            Event::RoomUpdated { id, .. } => {
                if let Some(rs) = self.room_state(id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    self.apply_room_update(&mut guard, event);
                }
            }
            Event::BookingUpdated { from_room_id, room_id, .. } if from_room_id != room_id => {
                let (Some(from), Some(to)) = (self.room_state(from_room_id), self.room_state(room_id)) else {
                    return;
                };
                if let (Ok(mut from), Ok(mut to)) = (from.try_write(), to.try_write()) {
                    self.index.apply_move(&mut from, &mut to, event);
                }
            }
            Event::BookingCreated { room_id, .. }
            | Event::BookingUpdated { room_id, .. }
            | Event::BookingDeleted { room_id, .. } => {
                if let Some(rs) = self.room_state(room_id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    self.index.apply(&mut guard, event);
                }
            }
        }
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

    /// WAL-append then apply. Nothing becomes visible if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.index.apply(rs, event);
        Ok(())
    }

    pub(super) fn room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_exists(&self, id: &Ulid) -> bool {
        self.rooms.contains_key(id)
    }

    /// Next reservation/room/office id. Monotonic, so id order is creation order.
    pub(super) fn next_id(&self) -> Result<Ulid, EngineError> {
        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.generate()
            .map_err(|_| EngineError::LimitExceeded("id space exhausted for this millisecond"))
    }

    fn attach_room(&self, rs: RoomState) {
        self.office_rooms.entry(rs.office_id).or_default().push(rs.id);
        self.rooms.insert(rs.id, Arc::new(RwLock::new(rs)));
    }

    /// Unregister a room and cascade-delete its reservations. Caller holds the room's write lock.
    fn detach_room(&self, rs: &mut RoomState) {
        let event = Event::RoomDeleted { id: rs.id };
        self.index.apply(rs, &event);
        self.rooms.remove(&rs.id);
        if let Some(mut siblings) = self.office_rooms.get_mut(&rs.office_id) {
            siblings.retain(|r| *r != rs.id);
        }
    }

    fn apply_room_update(&self, rs: &mut RoomState, event: &Event) {
        if let Event::RoomUpdated { office_id, .. } = event
            && *office_id != rs.office_id
        {
            if let Some(mut siblings) = self.office_rooms.get_mut(&rs.office_id) {
                siblings.retain(|r| *r != rs.id);
            }
            self.office_rooms.entry(*office_id).or_default().push(rs.id);
        }
        self.index.apply(rs, event);
    }

    /// Compact the WAL down to the events needed to recreate the current state.
    ///
    /// Holds the registry lock and a read lock on every room until the new
    /// file is swapped in, so no event can land in the old log after the
    /// snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;

        let mut offices: Vec<OfficeInfo> = self.offices.iter().map(|e| e.value().clone()).collect();
        offices.sort_by_key(|o| o.id);

        let mut room_ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort();
        let mut guards = Vec::with_capacity(room_ids.len());
        for id in &room_ids {
            if let Some(rs) = self.room_state(id) {
                guards.push(rs.read_owned().await);
            }
        }

        let mut events: Vec<Event> = offices
            .into_iter()
            .map(|o| Event::OfficeCreated {
                id: o.id,
                name: o.name,
                location: o.location,
            })
            .collect();
        for guard in &guards {
            events.push(Event::RoomCreated {
                id: guard.id,
                office_id: guard.office_id,
                name: guard.name.clone(),
                capacity: guard.capacity,
            });
        }
        for guard in &guards {
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                id: b.id,
                room_id: b.room_id,
                owner: b.owner.clone(),
                span: b.span,
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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

/// Write-lock two distinct rooms in id order so concurrent movers can't deadlock.
/// Returns the guards in argument order.
async fn lock_two(
    first: (Ulid, SharedRoomState),
    second: (Ulid, SharedRoomState),
) -> (OwnedRwLockWriteGuard<RoomState>, OwnedRwLockWriteGuard<RoomState>) {
    if first.0 < second.0 {
        let a = first.1.write_owned().await;
        let b = second.1.write_owned().await;
        (a, b)
    } else {
        let b = second.1.write_owned().await;
        let a = first.1.write_owned().await;
        (a, b)
    }
}
