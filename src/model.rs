use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::DEFAULT_PAGE_SIZE;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// For spans that were already validated (replayed events, tests).
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds. `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `self` is a committed interval, `candidate` the one asking to be admitted.
    ///
    /// Three clauses, kept separate so boundary behavior stays exact:
    /// the candidate starts inside `self`, the candidate ends inside `self`,
    /// or `self` lies entirely within the candidate. Touching endpoints never
    /// collide.
    pub fn conflicts_with(&self, candidate: &Span) -> bool {
        let starts_inside = self.start <= candidate.start && self.end > candidate.start;
        let ends_inside = self.start < candidate.end && self.end >= candidate.end;
        let swallowed = self.start >= candidate.start && self.end <= candidate.end;
        starts_inside || ends_inside || swallowed
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Principal on whose behalf an operation runs. Opaque: only ever compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A committed reservation of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    /// Fixed at creation.
    pub owner: CallerId,
    pub span: Span,
}

/// Every field a caller may set on a reservation, used by both create and update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub room_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

impl BookingRequest {
    pub fn new(room_id: Ulid, start: Ms, end: Ms) -> Self {
        Self { room_id, start, end }
    }

    pub fn span(&self) -> Option<Span> {
        Span::try_new(self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub office_id: Ulid,
    pub name: String,
    pub capacity: Option<u32>,
    /// Set when the room is deleted; writers that were queued on the lock must back off.
    pub retired: bool,
    /// Committed reservations, sorted by `span.start`.
    pub bookings: Vec<Reservation>,
}

impl RoomState {
    pub fn new(id: Ulid, office_id: Ulid, name: String, capacity: Option<u32>) -> Self {
        Self {
            id,
            office_id,
            name,
            capacity,
            retired: false,
            bookings: Vec::new(),
        }
    }

    /// Insert keeping sort order by span.start.
    pub fn insert_booking(&mut self, booking: Reservation) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Reservation> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Reservations that could collide with `span`: everything starting before
    /// `span.end`. Anything at or past that index cannot satisfy any conflict clause.
    pub fn candidates(&self, span: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < span.end);
        self.bookings[..right_bound].iter()
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            office_id: self.office_id,
            name: self.name.clone(),
            capacity: self.capacity,
        }
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OfficeCreated {
        id: Ulid,
        name: String,
        location: String,
    },
    OfficeUpdated {
        id: Ulid,
        name: String,
        location: String,
    },
    /// Cascades to the office's rooms and their reservations.
    OfficeDeleted {
        id: Ulid,
    },
    RoomCreated {
        id: Ulid,
        office_id: Ulid,
        name: String,
        capacity: Option<u32>,
    },
    RoomUpdated {
        id: Ulid,
        office_id: Ulid,
        name: String,
        capacity: Option<u32>,
    },
    /// Cascades to the room's reservations.
    RoomDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        room_id: Ulid,
        owner: CallerId,
        span: Span,
    },
    BookingUpdated {
        id: Ulid,
        from_room_id: Ulid,
        room_id: Ulid,
        span: Span,
    },
    BookingDeleted {
        id: Ulid,
        room_id: Ulid,
    },
}

// ── Query types ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfficeInfo {
    pub id: Ulid,
    pub name: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub office_id: Ulid,
    pub name: String,
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub room_id: Ulid,
    pub owner: CallerId,
    pub start: Ms,
    pub end: Ms,
}

impl From<&Reservation> for BookingInfo {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            room_id: r.room_id,
            owner: r.owner.clone(),
            start: r.span.start,
            end: r.span.end,
        }
    }
}

/// Caller-supplied listing filters. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub room_id: Option<Ulid>,
    pub user_id: Option<CallerId>,
    /// Keep bookings with `start >= start_from`.
    pub start_from: Option<Ms>,
    /// Keep bookings with `end <= end_until`.
    pub end_until: Option<Ms>,
}

impl BookingFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.room_id.is_none_or(|id| r.room_id == id)
            && self.user_id.as_ref().is_none_or(|u| &r.owner == u)
            && self.start_from.is_none_or(|t| r.span.start >= t)
            && self.end_until.is_none_or(|t| r.span.end <= t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFilter {
    pub office_id: Option<Ulid>,
    pub capacity: Option<u32>,
}

impl RoomFilter {
    pub fn matches(&self, room: &RoomInfo) -> bool {
        self.office_id.is_none_or(|id| room.office_id == id)
            && self.capacity.is_none_or(|c| room.capacity == Some(c))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfficeFilter {
    /// Case-insensitive substring of the office location. Empty matches everything.
    pub location: Option<String>,
}

impl OfficeFilter {
    pub fn matches(&self, office: &OfficeInfo) -> bool {
        self.location
            .as_ref()
            .is_none_or(|needle| office.location.to_lowercase().contains(&needle.to_lowercase()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches before the limit/offset window was applied.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    /// Cut the `req` window out of an already ordered result set.
    pub fn window(sorted: Vec<T>, req: PageRequest) -> Self {
        let total = sorted.len();
        let items = sorted.into_iter().skip(req.offset).take(req.limit).collect();
        Self {
            items,
            total,
            limit: req.limit,
            offset: req.offset,
        }
    }
}
