use uuid::Uuid;

use crate::{Booking, NewBooking};

/// Half-open overlap test: `[start1, end1)` and `[start2, end2)` share a point
/// iff `start1 < end2 && start2 < end1`. Touching boundaries do not overlap.
pub fn overlaps<T: PartialOrd>(start1: T, end1: T, start2: T, end2: T) -> bool {
    start1 < end2 && start2 < end1
}

pub fn booking_overlaps(candidate: &NewBooking, existing: &Booking) -> bool {
    overlaps(
        candidate.start_time,
        candidate.end_time,
        existing.start_time,
        existing.end_time,
    )
}

/// Active bookings that collide with the candidate, in input order.
pub fn find_conflicts<'a>(candidate: &NewBooking, existing: &'a [Booking]) -> Vec<&'a Booking> {
    existing
        .iter()
        .filter(|booking| booking.schedule_id == candidate.schedule_id)
        .filter(|booking| booking.status.is_active())
        .filter(|booking| booking_overlaps(candidate, booking))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictVerdict {
    Free,
    /// The only overlapping booking is the candidate itself, already stored.
    AlreadyClaimed(Uuid),
    Taken(Vec<Uuid>),
}

/// Decides what the ingestion worker should do with a candidate.
pub fn evaluate(candidate: &NewBooking, existing: &[Booking]) -> ConflictVerdict {
    let conflicts = find_conflicts(candidate, existing);
    match conflicts.as_slice() {
        [] => ConflictVerdict::Free,
        [own] if own.is_same_claim(candidate) => ConflictVerdict::AlreadyClaimed(own.id),
        others => ConflictVerdict::Taken(others.iter().map(|b| b.id).collect()),
    }
}
