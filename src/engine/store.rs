use std::collections::BTreeSet;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Reservation lookups that don't live inside a room: which room holds a
/// reservation, and which reservations a caller owns.
pub struct BookingIndex {
    rooms: DashMap<Ulid, Ulid>,
    /// Ascending, which is creation order.
    by_owner: DashMap<CallerId, BTreeSet<Ulid>>,
}

impl Default for BookingIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingIndex {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            by_owner: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_of(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.rooms.get(booking_id).map(|e| *e.value())
    }

    pub fn owned_by(&self, caller: &CallerId) -> Vec<Ulid> {
        self.by_owner
            .get(caller)
            .map(|e| e.value().iter().copied().collect())
            .unwrap_or_default()
    }

    fn track(&self, r: &Reservation) {
        self.rooms.insert(r.id, r.room_id);
        self.by_owner.entry(r.owner.clone()).or_default().insert(r.id);
    }

    fn forget(&self, r: &Reservation) {
        self.rooms.remove(&r.id);
        if let Some(mut ids) = self.by_owner.get_mut(&r.owner) {
            ids.remove(&r.id);
        }
        self.by_owner.remove_if(&r.owner, |_, ids| ids.is_empty());
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to the room it targets. Caller holds the room's write lock.
    /// Moves between rooms go through [`BookingIndex::apply_move`].
    pub fn apply(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::BookingCreated { id, room_id, owner, span } => {
                let booking = Reservation {
                    id: *id,
                    room_id: *room_id,
                    owner: owner.clone(),
                    span: *span,
                };
                self.track(&booking);
                rs.insert_booking(booking);
            }
            Event::BookingUpdated { id, span, .. } => {
                if let Some(mut booking) = rs.remove_booking(*id) {
                    booking.span = *span;
                    rs.insert_booking(booking);
                }
            }
            Event::BookingDeleted { id, .. } => {
                if let Some(booking) = rs.remove_booking(*id) {
                    self.forget(&booking);
                }
            }
            Event::RoomUpdated { office_id, name, capacity, .. } => {
                rs.office_id = *office_id;
                rs.name = name.clone();
                rs.capacity = *capacity;
            }
            Event::RoomDeleted { .. } => {
                rs.retired = true;
                for booking in rs.bookings.drain(..) {
                    self.forget(&booking);
                }
            }
            // Registry membership is handled by the engine's maps, not here.
            Event::OfficeCreated { .. }
            | Event::OfficeUpdated { .. }
            | Event::OfficeDeleted { .. }
            | Event::RoomCreated { .. } => {}
        }
    }

    /// Apply a `BookingUpdated` whose room changes. Caller holds both write locks.
    pub fn apply_move(&self, from: &mut RoomState, to: &mut RoomState, event: &Event) {
        if let Event::BookingUpdated { id, room_id, span, .. } = event
            && let Some(mut booking) = from.remove_booking(*id)
        {
            booking.room_id = *room_id;
            booking.span = *span;
            self.rooms.insert(*id, *room_id);
            to.insert_booking(booking);
        }
    }
}
