use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

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

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Empty spans never overlap anything, including each other.
    pub fn overlaps(&self, other: &Span) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn clamp_to(&self, window: &Span) -> Option<Span> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        (start < end).then_some(Span { start, end })
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "completed" => Some(BookingStatus::Completed),
            _ => None,
        }
    }
}

/// What a booking reserves: a trainer's time, or a seat in a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingTarget {
    Trainer(Ulid),
    Class(Ulid),
}

impl BookingTarget {
    pub fn class_id(&self) -> Option<Ulid> {
        match self {
            BookingTarget::Class(id) => Some(*id),
            BookingTarget::Trainer(_) => None,
        }
    }

    pub fn is_session(&self) -> bool {
        matches!(self, BookingTarget::Trainer(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    /// For class bookings, the trainer running the class.
    pub trainer_id: Ulid,
    pub target: BookingTarget,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub completed_at: Option<Ms>,
}

/// Immutable routing facts about a booking, kept in the engine-wide index so a
/// cancel or complete knows which ledgers to lock before touching the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRef {
    pub user_id: Ulid,
    pub trainer_id: Ulid,
    pub target: BookingTarget,
}

/// Input for a personal-training booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub id: Ulid,
    pub user_id: Ulid,
    pub trainer_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub notes: Option<String>,
}

// ── Classes (group classes and workout schedules) ────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassKind {
    GroupClass,
    WorkoutSchedule,
}

impl ClassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassKind::GroupClass => "group_class",
            ClassKind::WorkoutSchedule => "workout_schedule",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassStatus {
    Active,
    Cancelled,
    Completed,
}

impl ClassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassStatus::Active => "active",
            ClassStatus::Cancelled => "cancelled",
            ClassStatus::Completed => "completed",
        }
    }
}

/// Approval workflow state. Group classes and admin-created schedules start
/// out `Approved`; trainer proposals start out `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Approval {
    Pending {
        proposed_by: Ulid,
        notes: Option<String>,
    },
    Approved {
        by: Option<Ulid>,
        at: Ms,
    },
    Rejected {
        by: Option<Ulid>,
        at: Ms,
        reason: Option<String>,
    },
}

impl Approval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Approval::Pending { .. } => "pending",
            Approval::Approved { .. } => "approved",
            Approval::Rejected { .. } => "rejected",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Approval::Pending { .. })
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Approval::Approved { .. })
    }

    /// Proposal notes or rejection reason, whichever applies.
    pub fn note(&self) -> Option<&str> {
        match self {
            Approval::Pending { notes, .. } => notes.as_deref(),
            Approval::Rejected { reason, .. } => reason.as_deref(),
            Approval::Approved { .. } => None,
        }
    }
}

/// Input for creating or proposing a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClass {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub kind: ClassKind,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub capacity: u32,
}

/// A capacity-bearing class: a group class or a workout schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassState {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub kind: ClassKind,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub span: Span,
    pub capacity: u32,
    /// Invariant: `participants == roster.len() <= capacity`.
    pub participants: u32,
    pub status: ClassStatus,
    pub approval: Approval,
    /// Confirmed booking ids.
    pub roster: Vec<Ulid>,
    pub created_at: Ms,
}

impl ClassState {
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.participants)
    }

    /// Listed in the general schedule and open for booking.
    pub fn is_visible(&self) -> bool {
        self.status == ClassStatus::Active && self.approval.is_approved()
    }
}

// ── Ledgers ──────────────────────────────────────────────────────

/// What a ledger entry holds time for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Personal-training session (confirmed or completed).
    Session,
    /// Seat in a class. Member ledgers only.
    Seat { class_id: Ulid },
    /// A class the trainer runs. Trainer ledgers only.
    Class { approved: bool },
    /// Cancelled session whose slot is not offered again.
    Forfeited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Ulid,
    pub span: Span,
    pub kind: EntryKind,
}

impl LedgerEntry {
    /// Pending classes are the only entries that do not yet hold time firmly.
    pub fn is_committed(&self) -> bool {
        !matches!(self.kind, EntryKind::Class { approved: false })
    }
}

/// Sorted interval set shared by trainer and member ledgers.
#[derive(Debug, Clone, Default)]
pub struct Entries {
    items: Vec<LedgerEntry>,
}

impl Entries {
    /// Insert entry maintaining sort order by span.start.
    pub fn insert(&mut self, entry: LedgerEntry) {
        let pos = self
            .items
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.items.insert(pos, entry);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<LedgerEntry> {
        let pos = self.items.iter().position(|e| e.id == id)?;
        Some(self.items.remove(pos))
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut LedgerEntry> {
        self.items.iter_mut().find(|e| e.id == id)
    }

    pub fn get(&self, id: Ulid) -> Option<&LedgerEntry> {
        self.items.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Entries that have not yet ended at `now`.
    pub fn live_len(&self, now: Ms) -> usize {
        self.items.iter().filter(|e| e.span.end > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.items.iter()
    }

    /// Return only entries whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &LedgerEntry> {
        let right_bound = self.items.partition_point(|e| e.span.start < query.end);
        let query = *query;
        self.items[..right_bound]
            .iter()
            .filter(move |e| e.span.overlaps(&query))
    }
}

/// A trainer's time: sessions, classes, and offered availability.
#[derive(Debug, Clone)]
pub struct TrainerLedger {
    pub id: Ulid,
    pub entries: Entries,
    /// Offered slots per UTC date.
    pub availability: BTreeMap<NaiveDate, Vec<Span>>,
}

impl TrainerLedger {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            entries: Entries::default(),
            availability: BTreeMap::new(),
        }
    }
}

/// A member's confirmed time plus every booking record they own.
#[derive(Debug, Clone)]
pub struct MemberLedger {
    pub id: Ulid,
    pub entries: Entries,
    pub bookings: HashMap<Ulid, Booking>,
}

impl MemberLedger {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            entries: Entries::default(),
            bookings: HashMap::new(),
        }
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types. Flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClassCreated {
        id: Ulid,
        trainer_id: Ulid,
        kind: ClassKind,
        name: String,
        description: Option<String>,
        category: Option<String>,
        span: Span,
        capacity: u32,
        approval: Approval,
        at: Ms,
    },
    ClassApproved {
        id: Ulid,
        trainer_id: Ulid,
        by: Option<Ulid>,
        at: Ms,
    },
    ClassRejected {
        id: Ulid,
        trainer_id: Ulid,
        by: Option<Ulid>,
        reason: Option<String>,
        at: Ms,
    },
    ClassCancelled {
        id: Ulid,
        trainer_id: Ulid,
        at: Ms,
    },
    ClassCompleted {
        id: Ulid,
        trainer_id: Ulid,
        at: Ms,
    },
    /// Class moved in time, possibly to another trainer. `trainer_id` is
    /// the trainer it leaves.
    ClassRescheduled {
        id: Ulid,
        trainer_id: Ulid,
        to_trainer: Ulid,
        span: Span,
        at: Ms,
    },
    ClassDeleted {
        id: Ulid,
        trainer_id: Ulid,
    },
    BookingConfirmed {
        id: Ulid,
        user_id: Ulid,
        trainer_id: Ulid,
        target: BookingTarget,
        span: Span,
        notes: Option<String>,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        user_id: Ulid,
        reason: Option<String>,
        /// Whether a personal session's slot goes back on offer.
        reoffer: bool,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        user_id: Ulid,
        at: Ms,
    },
    AvailabilitySet {
        trainer_id: Ulid,
        date: NaiveDate,
        slots: Vec<Span>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub id: Ulid,
    pub kind: &'static str,
    pub start: Ms,
    pub end: Ms,
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub booked_at: Ms,
}

/// Personal-training sessions a member may still book this month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Unlimited,
    Sessions { allowed: u32, used: u32 },
    /// No active subscription.
    None,
    /// Subscription service unreachable and the policy is fail-open.
    Unknown,
}

impl Remaining {
    pub fn count(&self) -> Option<u32> {
        match self {
            Remaining::Sessions { allowed, used } => Some(allowed.saturating_sub(*used)),
            Remaining::None => Some(0),
            Remaining::Unlimited | Remaining::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassFilter {
    pub kind: Option<ClassKind>,
    pub trainer_id: Option<Ulid>,
    pub category: Option<String>,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: Ms, end: Ms, kind: EntryKind) -> LedgerEntry {
        LedgerEntry {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind,
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn empty_span_never_overlaps() {
        let empty = Span { start: 150, end: 150 };
        let wide = Span::new(0, 1000);
        assert!(!empty.overlaps(&wide));
        assert!(!wide.overlaps(&empty));
        assert!(!empty.overlaps(&empty));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn span_clamp() {
        let s = Span::new(100, 400);
        assert_eq!(s.clamp_to(&Span::new(200, 1000)), Some(Span::new(200, 400)));
        assert_eq!(s.clamp_to(&Span::new(400, 1000)), None);
    }

    #[test]
    fn entries_stay_sorted() {
        let mut entries = Entries::default();
        entries.insert(entry(300, 400, EntryKind::Session));
        entries.insert(entry(100, 200, EntryKind::Class { approved: true }));
        entries.insert(entry(200, 300, EntryKind::Forfeited));
        let starts: Vec<Ms> = entries.iter().map(|e| e.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn entries_remove_middle_preserves_order() {
        let mut entries = Entries::default();
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        for (i, &id) in ids.iter().enumerate() {
            entries.insert(LedgerEntry {
                id,
                span: Span::new((i as Ms) * 100, (i as Ms) * 100 + 50),
                kind: EntryKind::Session,
            });
        }
        assert!(entries.remove(ids[1]).is_some());
        assert!(entries.remove(Ulid::new()).is_none());
        let remaining: Vec<Ulid> = entries.iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![ids[0], ids[2]]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut entries = Entries::default();
        entries.insert(entry(100, 200, EntryKind::Session));
        entries.insert(entry(450, 600, EntryKind::Session));
        entries.insert(entry(1000, 1100, EntryKind::Session));

        let hits: Vec<_> = entries.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut entries = Entries::default();
        entries.insert(entry(100, 200, EntryKind::Session));
        assert_eq!(entries.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn overlapping_large_entry_spanning_query() {
        let mut entries = Entries::default();
        entries.insert(entry(0, 10_000, EntryKind::Class { approved: true }));
        assert_eq!(entries.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn pending_class_is_not_committed() {
        assert!(!entry(0, 10, EntryKind::Class { approved: false }).is_committed());
        assert!(entry(0, 10, EntryKind::Class { approved: true }).is_committed());
        assert!(entry(0, 10, EntryKind::Forfeited).is_committed());
    }

    #[test]
    fn remaining_counts() {
        assert_eq!(Remaining::Sessions { allowed: 4, used: 1 }.count(), Some(3));
        assert_eq!(Remaining::Sessions { allowed: 2, used: 5 }.count(), Some(0));
        assert_eq!(Remaining::Unlimited.count(), None);
        assert_eq!(Remaining::None.count(), Some(0));
    }

    #[test]
    fn booking_status_parse() {
        assert_eq!(BookingStatus::parse("Cancelled"), Some(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::parse("canceled"), Some(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::parse("no-show"), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AvailabilitySet {
            trainer_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            slots: vec![Span::new(1000, 2000)],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
