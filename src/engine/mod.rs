mod admission;
mod availability;
mod conflict;
mod directory;
mod error;
mod lifecycle;
mod queries;
mod reconcile;

pub use admission::BookingRequest;
pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use directory::{NewRoom, RoomUpdate};
pub use error::EngineError;
pub use lifecycle::BookingChange;
pub use reconcile::{derive_status, reconcile_state, SweepReport};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::EngineOptions;
use crate::model::*;
use crate::wal::Wal;

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
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
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
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// In-memory booking state, rebuilt from the WAL on start.
///
/// Each room's bookings live behind their own `RwLock`; every check-then-write
/// on a room runs under its write lock. Room and user administration also
/// holds `directory`, which is always taken before any room lock.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    /// Deleted rooms, kept so their cancelled bookings stay readable.
    pub(super) archived: DashMap<Ulid, SharedRoomState>,
    pub(super) users: DashMap<Ulid, User>,
    pub(super) room_names: DashMap<String, Ulid>,
    /// Reverse lookup: booking id → room id.
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    pub(super) directory: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) options: EngineOptions,
}

/// Apply an event to one room. Caller holds the write lock.
/// Returns how many bookings the event cancelled as a cascade.
pub(super) fn apply_to_room(
    rs: &mut RoomState,
    event: &Event,
    booking_index: &DashMap<Ulid, Ulid>,
) -> usize {
    match event {
        Event::BookingCreated {
            id,
            room_id,
            user_id,
            span,
            purpose,
            participants,
            status,
            created_at,
        } => {
            // Replay after compaction may see the same booking twice.
            if rs.booking(id).is_some() {
                return 0;
            }
            rs.insert_booking(Booking {
                id: *id,
                room_id: *room_id,
                user_id: *user_id,
                span: *span,
                purpose: purpose.clone(),
                participants: participants.clone(),
                status: *status,
                created_at: *created_at,
            });
            booking_index.insert(*id, *room_id);
            0
        }
        Event::BookingTransitioned { id, status, span, .. } => {
            revise_booking(rs, id, *status, *span);
            0
        }
        Event::BookingDetailsUpdated {
            id,
            purpose,
            participants,
            ..
        } => {
            if let Some(b) = rs.booking_mut(id) {
                b.purpose = purpose.clone();
                b.participants = participants.clone();
            }
            0
        }
        Event::BookingRevised {
            id,
            status,
            span,
            purpose,
            participants,
            ..
        } => {
            revise_booking(rs, id, *status, *span);
            if let Some(b) = rs.booking_mut(id) {
                b.purpose = purpose.clone();
                b.participants = participants.clone();
            }
            0
        }
        Event::RoomUpdated {
            name,
            capacity,
            location,
            amenities,
            ..
        } => {
            rs.room.name = name.clone();
            rs.room.capacity = *capacity;
            rs.room.location = location.clone();
            rs.room.amenities = amenities.iter().cloned().collect();
            0
        }
        Event::RoomMaintenanceSet { maintenance, .. } => {
            // Leaving maintenance lands on Available; the reconciler settles it.
            rs.room.status = if *maintenance {
                RoomStatus::Maintenance
            } else {
                RoomStatus::Available
            };
            0
        }
        Event::RoomDeleted { .. } => {
            rs.retired = true;
            let cancelled = cancel_where(rs, |_| true);
            // No booking is live after the cascade.
            if rs.room.status == RoomStatus::Booked {
                rs.room.status = RoomStatus::Available;
            }
            cancelled
        }
        Event::UserDeleted { id } => cancel_where(rs, |b| b.user_id == *id),
        Event::RoomCreated { .. } | Event::UserRegistered { .. } => 0,
    }
}

fn revise_booking(rs: &mut RoomState, id: &Ulid, status: BookingStatus, span: Span) {
    if rs.booking(id).is_some_and(|b| b.span != span) {
        rs.move_booking(id, span);
    }
    if let Some(b) = rs.booking_mut(id) {
        b.status = status;
    }
}

fn cancel_where(rs: &mut RoomState, pred: impl Fn(&Booking) -> bool) -> usize {
    let mut cancelled = 0;
    for b in rs.bookings.iter_mut().filter(|b| b.is_active() && pred(b)) {
        b.status = BookingStatus::Cancelled;
        cancelled += 1;
    }
    cancelled
}

fn room_from_event(
    id: Ulid,
    name: &str,
    capacity: u32,
    location: &Option<String>,
    amenities: &[String],
) -> Room {
    Room {
        id,
        name: name.to_string(),
        capacity,
        location: location.clone(),
        amenities: amenities.iter().cloned().collect(),
        status: RoomStatus::Available,
    }
}

/// Room an event targets, for events applied through `apply_to_room`.
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { room_id, .. }
        | Event::BookingTransitioned { room_id, .. }
        | Event::BookingDetailsUpdated { room_id, .. }
        | Event::BookingRevised { room_id, .. } => Some(*room_id),
        Event::RoomUpdated { id, .. } | Event::RoomMaintenanceSet { id, .. } => Some(*id),
        Event::RoomCreated { .. }
        | Event::RoomDeleted { .. }
        | Event::UserRegistered { .. }
        | Event::UserDeleted { .. } => None,
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, options: EngineOptions) -> io::Result<Self> {
        let (wal, replay) = Wal::recover(&wal_path)?;
        if replay.discarded_tail {
            warn!(
                "WAL {} had a torn tail; truncated to {} bytes",
                wal_path.display(),
                replay.valid_len
            );
        }
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            archived: DashMap::new(),
            users: DashMap::new(),
            room_names: DashMap::new(),
            booking_index: DashMap::new(),
            directory: Mutex::new(()),
            wal_tx,
            options,
        };
        for event in &replay.events {
            engine.replay_event(event);
        }
        info!(
            "replayed {} events: {} rooms, {} users, {} bookings",
            replay.events.len(),
            engine.rooms.len(),
            engine.users.len(),
            engine.booking_index.len()
        );
        Ok(engine)
    }

    /// We're the sole owner of every Arc during replay, so `try_write` always
    /// succeeds; never block here since we may be inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, name, role } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        role: *role,
                    },
                );
            }
            Event::UserDeleted { id } => {
                self.users.remove(id);
                for entry in self.rooms.iter() {
                    if let Ok(mut guard) = entry.value().try_write() {
                        apply_to_room(&mut guard, event, &self.booking_index);
                    }
                }
            }
            Event::RoomCreated {
                id,
                name,
                capacity,
                location,
                amenities,
            } => {
                if self.rooms.contains_key(id) {
                    return;
                }
                let room = room_from_event(*id, name, *capacity, location, amenities);
                self.rooms
                    .insert(*id, Arc::new(RwLock::new(RoomState::new(room))));
                self.room_names.insert(name.clone(), *id);
            }
            Event::RoomDeleted { id } => {
                if let Some((_, rs)) = self.rooms.remove(id) {
                    if let Ok(mut guard) = rs.try_write() {
                        self.room_names.remove_if(&guard.room.name, |_, owner| owner == id);
                        apply_to_room(&mut guard, event, &self.booking_index);
                    }
                    self.archived.insert(*id, rs);
                }
            }
            other => {
                let Some(room_id) = event_room_id(other) else {
                    return;
                };
                let Some(rs) = self.room_or_archived(&room_id) else {
                    return;
                };
                if let Ok(mut guard) = rs.try_write() {
                    if let Event::RoomUpdated { name, .. } = other {
                        self.room_names
                            .remove_if(&guard.room.name, |_, owner| *owner == room_id);
                        self.room_names.insert(name.clone(), room_id);
                    }
                    apply_to_room(&mut guard, other, &self.booking_index);
                }
            }
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Write event to WAL via the background group-commit writer.
    /// Bounded by `persist_timeout`; on timeout the outcome is unknown.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let append = async {
            self.wal_tx
                .send(WalCommand::Append {
                    event: event.clone(),
                    response: tx,
                })
                .await
                .map_err(|_| EngineError::PersistenceFailure("WAL writer shut down".into()))?;
            rx.await
                .map_err(|_| EngineError::PersistenceFailure("WAL writer dropped response".into()))?
                .map_err(|e| EngineError::PersistenceFailure(e.to_string()))
        };
        match tokio::time::timeout(self.options.persist_timeout, append).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!(crate::observability::WAL_PERSIST_TIMEOUTS_TOTAL).increment(1);
                warn!(
                    "WAL append timed out after {:?}",
                    self.options.persist_timeout
                );
                Err(EngineError::PersistenceTimeout)
            }
        }
    }

    /// WAL-append then apply. Memory changes only after the event is durable.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<usize, EngineError> {
        self.wal_append(event).await?;
        Ok(apply_to_room(rs, event, &self.booking_index))
    }

    pub fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    fn room_or_archived(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.get_room_state(id)
            .or_else(|| self.archived.get(id).map(|e| e.value().clone()))
    }

    /// Room holding a booking, live or archived.
    pub(super) fn resolve_booking(&self, booking_id: &Ulid) -> Result<SharedRoomState, EngineError> {
        let room_id = self
            .booking_index
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*booking_id))?;
        self.room_or_archived(&room_id)
            .ok_or(EngineError::NotFound(*booking_id))
    }

    /// Live room ids in ascending order, the lock order for multi-room work.
    pub(super) fn sorted_room_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.rooms.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Every room in lock order, including archived ones when asked.
    pub(super) fn room_states(&self, include_archived: bool) -> Vec<SharedRoomState> {
        let mut entries: Vec<(Ulid, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        if include_archived {
            entries.extend(self.archived.iter().map(|e| (*e.key(), e.value().clone())));
        }
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, rs)| rs).collect()
    }

    /// Resolve a session identity to an actor with its stored role.
    pub fn resolve_actor(&self, user_id: &Ulid) -> Option<Actor> {
        self.users.get(user_id).map(|u| Actor {
            id: u.id,
            role: u.role,
        })
    }

    /// Rewrite the WAL with just the events needed to rebuild current state.
    ///
    /// Holds the directory lock and every room's read lock while the snapshot
    /// is taken and swapped in, so no append can slip between the two.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        let mut events: Vec<Event> = users
            .into_iter()
            .map(|u| Event::UserRegistered {
                id: u.id,
                name: u.name,
                role: u.role,
            })
            .collect();

        // Archived rooms first: a live room may have reused an archived name.
        let mut states: Vec<SharedRoomState> =
            self.archived.iter().map(|e| e.value().clone()).collect();
        states.extend(self.room_states(false));
        let mut guards = Vec::new();
        for rs in states {
            guards.push(rs.read_owned().await);
        }
        for guard in &guards {
            emit_room(guard, &mut events);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::PersistenceFailure(e.to_string()))
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

fn emit_room(rs: &RoomState, events: &mut Vec<Event>) {
    let room = &rs.room;
    events.push(Event::RoomCreated {
        id: room.id,
        name: room.name.clone(),
        capacity: room.capacity,
        location: room.location.clone(),
        amenities: room.amenities.iter().cloned().collect(),
    });
    if room.status == RoomStatus::Maintenance {
        events.push(Event::RoomMaintenanceSet {
            id: room.id,
            maintenance: true,
        });
    }
    for b in &rs.bookings {
        events.push(Event::BookingCreated {
            id: b.id,
            room_id: b.room_id,
            user_id: b.user_id,
            span: b.span,
            purpose: b.purpose.clone(),
            participants: b.participants.clone(),
            status: b.status,
            created_at: b.created_at,
        });
    }
    if rs.retired {
        events.push(Event::RoomDeleted { id: room.id });
    }
}
