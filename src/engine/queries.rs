use std::collections::BTreeMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::access::authorize;
use super::conflict::find_conflict;
use super::mutations::MAX_RELOCATE_ATTEMPTS;
use super::{Engine, EngineError};

fn check_page(page: &PageRequest) -> Result<(), EngineError> {
    if page.limit > MAX_PAGE_SIZE {
        return Err(EngineError::LimitExceeded("page size too large"));
    }
    Ok(())
}

impl Engine {
    pub async fn get_booking(&self, caller: &CallerId, id: Ulid) -> Result<Reservation, EngineError> {
        for _ in 0..MAX_RELOCATE_ATTEMPTS {
            let room_id = self.index.room_of(&id).ok_or(EngineError::NotFound(id))?;
            let Some(rs) = self.room_state(&room_id) else {
                continue;
            };
            let guard = rs.read().await;
            let Some(booking) = self.locate(&guard, id)? else {
                continue;
            };
            authorize(caller, &booking)?;
            return Ok(booking);
        }
        Err(EngineError::LimitExceeded("booking relocated concurrently"))
    }

    /// Whether `span` collides with a committed reservation on `room_id`,
    /// ignoring `exclude`.
    pub async fn has_conflict(
        &self,
        room_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let rs = self
            .room_state(&room_id)
            .ok_or(EngineError::ResourceNotFound(room_id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::ResourceNotFound(room_id));
        }
        Ok(find_conflict(&guard, &span, exclude).is_some())
    }

    /// The caller's own reservations matching `filter`, oldest first.
    ///
    /// Results are always restricted to `caller`: a `user_id` filter naming
    /// someone else selects nothing.
    pub async fn list_bookings(
        &self,
        caller: &CallerId,
        filter: &BookingFilter,
        page: PageRequest,
    ) -> Result<Page<BookingInfo>, EngineError> {
        check_page(&page)?;

        let mut by_room: BTreeMap<Ulid, Vec<Ulid>> = BTreeMap::new();
        for id in self.index.owned_by(caller) {
            if let Some(room_id) = self.index.room_of(&id)
                && filter.room_id.is_none_or(|r| r == room_id)
            {
                by_room.entry(room_id).or_default().push(id);
            }
        }

        let mut matched: Vec<BookingInfo> = Vec::new();
        for (room_id, ids) in by_room {
            let Some(rs) = self.room_state(&room_id) else {
                continue;
            };
            let guard = rs.read().await;
            matched.extend(
                ids.iter()
                    .filter_map(|id| guard.booking(*id))
                    .filter(|b| b.owner == *caller && filter.matches(b))
                    .map(BookingInfo::from),
            );
        }
        matched.sort_by_key(|b| b.id);
        Ok(Page::window(matched, page))
    }

    pub async fn get_room(&self, id: Ulid) -> Result<RoomInfo, EngineError> {
        let rs = self.room_state(&id).ok_or(EngineError::ResourceNotFound(id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::ResourceNotFound(id));
        }
        Ok(guard.info())
    }

    /// Rooms matching `filter`, ordered by id.
    pub async fn list_rooms(&self, filter: &RoomFilter, page: PageRequest) -> Result<Page<RoomInfo>, EngineError> {
        check_page(&page)?;
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(handles.len());
        for rs in handles {
            let guard = rs.read().await;
            let info = guard.info();
            if !guard.retired && filter.matches(&info) {
                rooms.push(info);
            }
        }
        rooms.sort_by_key(|r| r.id);
        Ok(Page::window(rooms, page))
    }

    pub fn list_offices(&self, filter: &OfficeFilter, page: PageRequest) -> Result<Page<OfficeInfo>, EngineError> {
        check_page(&page)?;
        let mut offices: Vec<OfficeInfo> = self
            .offices
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        offices.sort_by_key(|o| o.id);
        Ok(Page::window(offices, page))
    }

    pub fn get_office(&self, id: Ulid) -> Result<OfficeInfo, EngineError> {
        self.offices
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::ResourceNotFound(id))
    }
}
