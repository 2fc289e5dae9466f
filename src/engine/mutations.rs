use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::authorize;
use super::conflict::{check_no_conflict, validate_request};
use super::{lock_two, Engine, EngineError};

/// How often a read/update/delete re-resolves a reservation that moved to
/// another room between index lookup and lock acquisition.
pub(super) const MAX_RELOCATE_ATTEMPTS: usize = 3;

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_office(name: &str, location: &str) -> Result<(), EngineError> {
    check_name(name)?;
    if location.len() > MAX_LOCATION_LEN {
        return Err(EngineError::LimitExceeded("location too long"));
    }
    Ok(())
}

impl Engine {
    // ── Registry ─────────────────────────────────────────────

    pub async fn create_office(&self, name: String, location: String) -> Result<OfficeInfo, EngineError> {
        check_office(&name, &location)?;
        let _registry = self.registry_lock.lock().await;
        if self.offices.len() >= MAX_OFFICES {
            return Err(EngineError::LimitExceeded("too many offices"));
        }

        let id = self.next_id()?;
        let event = Event::OfficeCreated { id, name: name.clone(), location: location.clone() };
        self.wal_append(&event).await?;
        let office = OfficeInfo { id, name, location };
        self.offices.insert(id, office.clone());
        info!(office_id = %id, "office created");
        Ok(office)
    }

    /// Replace an office's name and location. Its rooms are untouched.
    pub async fn update_office(&self, id: Ulid, name: String, location: String) -> Result<OfficeInfo, EngineError> {
        check_office(&name, &location)?;
        let _registry = self.registry_lock.lock().await;
        if !self.offices.contains_key(&id) {
            return Err(EngineError::ResourceNotFound(id));
        }

        let event = Event::OfficeUpdated { id, name: name.clone(), location: location.clone() };
        self.wal_append(&event).await?;
        let office = OfficeInfo { id, name, location };
        self.offices.insert(id, office.clone());
        info!(office_id = %id, "office updated");
        Ok(office)
    }

    /// Delete an office together with its rooms and every reservation on them.
    pub async fn delete_office(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        if !self.offices.contains_key(&id) {
            return Err(EngineError::ResourceNotFound(id));
        }

        let mut room_ids = self.office_rooms.get(&id).map(|e| e.value().clone()).unwrap_or_default();
        room_ids.sort();
        let mut guards = Vec::with_capacity(room_ids.len());
        for room_id in &room_ids {
            if let Some(rs) = self.room_state(room_id) {
                guards.push(rs.write_owned().await);
            }
        }

        self.wal_append(&Event::OfficeDeleted { id }).await?;
        for guard in &mut guards {
            self.detach_room(guard);
        }
        self.office_rooms.remove(&id);
        self.offices.remove(&id);
        info!(office_id = %id, rooms = guards.len(), "office deleted");
        Ok(())
    }

    pub async fn create_room(
        &self,
        office_id: Ulid,
        name: String,
        capacity: Option<u32>,
    ) -> Result<RoomInfo, EngineError> {
        check_name(&name)?;
        let _registry = self.registry_lock.lock().await;
        if !self.offices.contains_key(&office_id) {
            return Err(EngineError::ResourceNotFound(office_id));
        }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }

        let id = self.next_id()?;
        let event = Event::RoomCreated { id, office_id, name: name.clone(), capacity };
        self.wal_append(&event).await?;
        let rs = RoomState::new(id, office_id, name, capacity);
        let room = rs.info();
        self.attach_room(rs);
        info!(room_id = %id, %office_id, "room created");
        Ok(room)
    }

    pub async fn update_room(
        &self,
        id: Ulid,
        office_id: Ulid,
        name: String,
        capacity: Option<u32>,
    ) -> Result<RoomInfo, EngineError> {
        check_name(&name)?;
        let _registry = self.registry_lock.lock().await;
        let rs = self.room_state(&id).ok_or(EngineError::ResourceNotFound(id))?;
        if !self.offices.contains_key(&office_id) {
            return Err(EngineError::ResourceNotFound(office_id));
        }
        let mut guard = rs.write().await;

        let event = Event::RoomUpdated { id, office_id, name, capacity };
        self.wal_append(&event).await?;
        self.apply_room_update(&mut guard, &event);
        Ok(guard.info())
    }

    /// Delete a room and every reservation on it.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        let rs = self.room_state(&id).ok_or(EngineError::ResourceNotFound(id))?;
        let mut guard = rs.write().await;

        self.wal_append(&Event::RoomDeleted { id }).await?;
        let cancelled = guard.bookings.len();
        self.detach_room(&mut guard);
        info!(room_id = %id, cancelled, "room deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Admit a new reservation for `caller`.
    ///
    /// Checks run in a fixed order: the room must exist, the interval must be
    /// well-formed and within limits, and no committed reservation on the room
    /// may collide with it. The conflict check and the commit happen under the
    /// room's write lock.
    pub async fn create_booking(
        &self,
        caller: &CallerId,
        req: BookingRequest,
    ) -> Result<Reservation, EngineError> {
        let rs = self
            .room_state(&req.room_id)
            .ok_or(EngineError::ResourceNotFound(req.room_id))?;
        let span = validate_request(&req)?;

        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::ResourceNotFound(req.room_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        check_no_conflict(&guard, &span, None)?;

        let booking = Reservation {
            id: self.next_id()?,
            room_id: req.room_id,
            owner: caller.clone(),
            span,
        };
        let event = Event::BookingCreated {
            id: booking.id,
            room_id: booking.room_id,
            owner: booking.owner.clone(),
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(booking_id = %booking.id, room_id = %booking.room_id, %caller, "booking created");
        Ok(booking)
    }

    /// Replace the room and interval of a reservation `caller` owns.
    ///
    /// Fails `NotFound`/`Forbidden` first, then `ResourceNotFound` for the
    /// target room, `InvalidInterval`, and finally `SchedulingConflict`
    /// against every reservation other than this one. Moving to another room
    /// holds both rooms' write locks.
    pub async fn update_booking(
        &self,
        caller: &CallerId,
        id: Ulid,
        req: BookingRequest,
    ) -> Result<Reservation, EngineError> {
        for _ in 0..MAX_RELOCATE_ATTEMPTS {
            let from_room_id = self.index.room_of(&id).ok_or(EngineError::NotFound(id))?;
            let Some(from) = self.room_state(&from_room_id) else {
                continue;
            };

            if req.room_id == from_room_id {
                let mut guard = from.write_owned().await;
                let Some(existing) = self.locate(&guard, id)? else {
                    continue;
                };
                authorize(caller, &existing)?;
                let span = validate_request(&req)?;
                check_no_conflict(&guard, &span, Some(id))?;

                let event = Event::BookingUpdated { id, from_room_id, room_id: req.room_id, span };
                self.persist_and_apply(&mut guard, &event).await?;
                info!(booking_id = %id, room_id = %req.room_id, "booking updated");
                return Ok(Reservation { span, ..existing });
            }

            let Some(to) = self.room_state(&req.room_id) else {
                let guard = from.read_owned().await;
                let Some(existing) = self.locate(&guard, id)? else {
                    continue;
                };
                authorize(caller, &existing)?;
                return Err(EngineError::ResourceNotFound(req.room_id));
            };

            let (mut from_guard, mut to_guard) = lock_two((from_room_id, from), (req.room_id, to)).await;
            let Some(existing) = self.locate(&from_guard, id)? else {
                continue;
            };
            authorize(caller, &existing)?;
            if to_guard.retired {
                return Err(EngineError::ResourceNotFound(req.room_id));
            }
            let span = validate_request(&req)?;
            if to_guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many bookings on room"));
            }
            check_no_conflict(&to_guard, &span, Some(id))?;

            let event = Event::BookingUpdated { id, from_room_id, room_id: req.room_id, span };
            self.wal_append(&event).await?;
            self.index.apply_move(&mut from_guard, &mut to_guard, &event);
            info!(booking_id = %id, from = %from_room_id, to = %req.room_id, "booking moved");
            return Ok(Reservation {
                room_id: req.room_id,
                span,
                ..existing
            });
        }
        Err(EngineError::LimitExceeded("booking relocated concurrently"))
    }

    /// Cancel a reservation `caller` owns. Permanent.
    pub async fn delete_booking(&self, caller: &CallerId, id: Ulid) -> Result<(), EngineError> {
        for _ in 0..MAX_RELOCATE_ATTEMPTS {
            let room_id = self.index.room_of(&id).ok_or(EngineError::NotFound(id))?;
            let Some(rs) = self.room_state(&room_id) else {
                continue;
            };
            let mut guard = rs.write_owned().await;
            let Some(existing) = self.locate(&guard, id)? else {
                continue;
            };
            authorize(caller, &existing)?;

            self.persist_and_apply(&mut guard, &Event::BookingDeleted { id, room_id }).await?;
            info!(booking_id = %id, %room_id, "booking deleted");
            return Ok(());
        }
        Err(EngineError::LimitExceeded("booking relocated concurrently"))
    }

    /// Find reservation `id` in a locked room. `Ok(None)` means it moved to
    /// another room after the caller resolved it, so the lookup should be retried.
    pub(super) fn locate(&self, rs: &RoomState, id: Ulid) -> Result<Option<Reservation>, EngineError> {
        if let Some(booking) = rs.booking(id) {
            return Ok(Some(booking.clone()));
        }
        match self.index.room_of(&id) {
            Some(now) if now != rs.id => Ok(None),
            _ => Err(EngineError::NotFound(id)),
        }
    }
}
