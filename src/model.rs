use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;
pub const WEEK_MS: Ms = 7 * DAY_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Saturates at `Ms::MAX` for spans wider than the `i64` range.
    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Midnight (UTC) of the day containing `t`.
pub fn start_of_day(t: Ms) -> Ms {
    t - t.rem_euclid(DAY_MS)
}

/// The Monday-to-Monday week (UTC) containing `t`, or `None` when that week
/// does not fit in `Ms`.
pub fn week_containing(t: Ms) -> Option<Span> {
    let day = t.div_euclid(DAY_MS);
    // 1970-01-01 was a Thursday, three days after a Monday.
    let monday = day - (day + 3).rem_euclid(7);
    let start = monday.checked_mul(DAY_MS)?;
    Some(Span::new(start, start.checked_add(WEEK_MS)?))
}

/// Render a timestamp for humans, e.g. in error messages.
pub fn format_ms(t: &Ms) -> String {
    chrono::DateTime::from_timestamp_millis(*t)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| t.to_string())
}

/// One booked slot on the shared machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub owner_id: String,
    pub span: Span,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub created_at: Ms,
}

/// Partial profile edit. The outer `Option` says whether the field is touched,
/// the inner one whether it is set or cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    pub display_name: Option<Option<String>>,
    pub color: Option<Option<String>>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.color.is_none()
    }
}

/// All reservations of the resource, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct BookingLedger {
    reservations: Vec<Reservation>,
    /// Longest duration ever inserted. Never shrinks, so it stays a safe bound
    /// for how far back an overlapping reservation can start.
    longest: Ms,
}

impl BookingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter()
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Insert maintaining sort order by start.
    pub fn insert(&mut self, reservation: Reservation) {
        self.longest = self.longest.max(reservation.span.duration_ms());
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == *id)?;
        Some(self.reservations.remove(pos))
    }

    /// Move a reservation to a new span, keeping the ledger sorted.
    pub fn reschedule(&mut self, id: &Ulid, span: Span) -> Option<&Reservation> {
        let mut reservation = self.remove(id)?;
        reservation.span = span;
        self.insert(reservation);
        self.get(id)
    }

    /// Reservations whose span overlaps `query`.
    ///
    /// Nothing starting at or after `query.end` can overlap, and nothing starting
    /// more than `longest` before `query.start` can reach into it, so only the
    /// slice between those two binary-searched bounds is scanned.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let horizon = query.start.saturating_sub(self.longest);
        let left = self.reservations.partition_point(|r| r.span.start < horizon);
        let right = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        let right = right.max(left);
        self.reservations[left..right]
            .iter()
            .filter(move |r| r.span.overlaps(query))
    }

    /// Reservations whose start lies in `window`, ascending by start.
    pub fn starting_within(&self, window: &Span) -> &[Reservation] {
        let left = self
            .reservations
            .partition_point(|r| r.span.start < window.start);
        let right = self
            .reservations
            .partition_point(|r| r.span.start < window.end);
        &self.reservations[left..right.max(left)]
    }
}

/// One WAL record. Replay applies them in file order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        id: Ulid,
        owner_id: String,
        span: Span,
        created_at: Ms,
    },
    ReservationUpdated {
        id: Ulid,
        span: Span,
    },
    ReservationDeleted {
        id: Ulid,
    },
    ProfileCreated {
        id: String,
        created_at: Ms,
    },
    ProfileUpdated {
        id: String,
        display_name: Option<String>,
        color: Option<String>,
    },
    AdminGranted {
        id: String,
    },
    AdminRevoked {
        id: String,
    },
}

impl Event {
    pub fn is_reservation_event(&self) -> bool {
        matches!(
            self,
            Event::ReservationCreated { .. }
                | Event::ReservationUpdated { .. }
                | Event::ReservationDeleted { .. }
        )
    }
}
