use std::collections::HashMap;

use ulid::Ulid;

use crate::directory::Allowance;
use crate::limits::*;
use crate::model::*;

use super::availability::{free_slots, offered_in};
use super::conflict::now_ms;
use super::mutations::{month_start, sessions_used};
use super::{Engine, EngineError};

fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInterval("end must be after start"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval("timestamp out of range"));
    }
    let window = Span::new(start, end);
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(window)
}

fn sorted(mut bookings: Vec<Booking>) -> Vec<Booking> {
    bookings.sort_by_key(|b| (b.span.start, b.id));
    bookings
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let user_id = self
            .bookings
            .get(&id)
            .map(|r| r.user_id)
            .ok_or(EngineError::NotFound(id))?;
        let member = self
            .members
            .get(&user_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let guard = member.read().await;
        guard.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn bookings_for_user(
        &self,
        user_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Vec<Booking> {
        let Some(member) = self.members.get(&user_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = member.read().await;
        sorted(
            guard
                .bookings
                .values()
                .filter(|b| status.is_none_or(|s| b.status == s))
                .cloned()
                .collect(),
        )
    }

    /// Bookings whose index entry satisfies `select`, grouped per member so
    /// each ledger is read once.
    async fn collect_bookings(
        &self,
        select: impl Fn(&BookingRef) -> bool,
        status: Option<BookingStatus>,
    ) -> Vec<Booking> {
        let mut by_user: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for entry in self.bookings.iter() {
            if select(entry.value()) {
                by_user.entry(entry.value().user_id).or_default().push(*entry.key());
            }
        }

        let mut out = Vec::new();
        for (user_id, ids) in by_user {
            let Some(member) = self.members.get(&user_id).map(|e| e.value().clone()) else {
                continue;
            };
            let guard = member.read().await;
            out.extend(
                ids.iter()
                    .filter_map(|id| guard.bookings.get(id))
                    .filter(|b| status.is_none_or(|s| b.status == s))
                    .cloned(),
            );
        }
        sorted(out)
    }

    /// Personal sessions and class seats on classes the trainer runs.
    pub async fn bookings_for_trainer(
        &self,
        trainer_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Vec<Booking> {
        self.collect_bookings(|r| r.trainer_id == trainer_id, status)
            .await
    }

    pub async fn bookings_for_class(
        &self,
        class_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Vec<Booking> {
        self.collect_bookings(|r| r.target == BookingTarget::Class(class_id), status)
            .await
    }

    /// Members currently holding a seat, in booking order.
    pub async fn participants(&self, class_id: Ulid) -> Result<Vec<Participant>, EngineError> {
        let class = self.get_class(class_id).await?;
        let mut out = Vec::with_capacity(class.roster.len());
        for booking_id in class.roster {
            let Ok(booking) = self.get_booking(booking_id).await else {
                continue;
            };
            out.push(Participant {
                booking_id,
                user_id: booking.user_id,
                booked_at: booking.created_at,
            });
        }
        Ok(out)
    }

    pub async fn get_class(&self, id: Ulid) -> Result<ClassState, EngineError> {
        let handle = self.class_handle(&id).ok_or(EngineError::NotFound(id))?;
        let class = handle.read().await.clone();
        Ok(class)
    }

    async fn classes_where(&self, keep: impl Fn(&ClassState) -> bool) -> Vec<ClassState> {
        let handles: Vec<_> = self.classes.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let class = handle.read().await;
            if keep(&class) {
                out.push(class.clone());
            }
        }
        out.sort_by_key(|c| (c.span.start, c.id));
        out
    }

    /// The general schedule: approved, active classes matching the filter.
    pub async fn list_classes(&self, filter: &ClassFilter) -> Vec<ClassState> {
        self.classes_where(|c| {
            c.is_visible()
                && filter.kind.is_none_or(|k| c.kind == k)
                && filter.trainer_id.is_none_or(|t| c.trainer_id == t)
                && filter
                    .category
                    .as_deref()
                    .is_none_or(|cat| c.category.as_deref().is_some_and(|own| own.eq_ignore_ascii_case(cat)))
                && filter.from.is_none_or(|from| c.span.start >= from)
                && filter.to.is_none_or(|to| c.span.end <= to)
        })
        .await
    }

    /// Schedules awaiting an approval decision, optionally for one trainer.
    pub async fn pending_schedules(&self, trainer_id: Option<Ulid>) -> Vec<ClassState> {
        self.classes_where(|c| {
            c.approval.is_pending()
                && c.status == ClassStatus::Active
                && trainer_id.is_none_or(|t| c.trainer_id == t)
        })
        .await
    }

    /// Offered time in the window not taken by committed sessions or classes.
    pub async fn free_slots(
        &self,
        trainer_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = query_window(start, end)?;
        let Some(trainer) = self.trainers.get(&trainer_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = trainer.read().await;
        let offered = offered_in(&guard.availability, &window);
        let busy: Vec<Span> = guard
            .entries
            .overlapping(&window)
            .filter(|e| e.is_committed())
            .map(|e| e.span)
            .collect();
        Ok(free_slots(&offered, &busy, min_duration.unwrap_or(0)))
    }

    /// Everything on the trainer's ledger in the window, pending proposals included.
    pub async fn check_conflicts(
        &self,
        trainer_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<ConflictInfo>, EngineError> {
        let window = query_window(start, end)?;
        let Some(trainer) = self.trainers.get(&trainer_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = trainer.read().await;
        Ok(guard
            .entries
            .overlapping(&window)
            .map(|e| ConflictInfo {
                id: e.id,
                kind: match e.kind {
                    EntryKind::Session => "session",
                    EntryKind::Class { approved: true } => "class",
                    EntryKind::Class { approved: false } => "pending_class",
                    EntryKind::Seat { .. } => "seat",
                    EntryKind::Forfeited => "forfeited",
                },
                start: e.span.start,
                end: e.span.end,
                approved: e.is_committed(),
            })
            .collect())
    }

    /// Personal sessions the member may still book this month.
    pub async fn remaining_sessions(&self, user_id: Ulid) -> Result<Remaining, EngineError> {
        let Some(allowance) = self.allowance(user_id).await? else {
            return Ok(Remaining::Unknown);
        };
        let allowed = match allowance {
            Allowance::Unlimited => return Ok(Remaining::Unlimited),
            Allowance::Inactive => return Ok(Remaining::None),
            Allowance::PerMonth(n) => n,
        };
        let used = match self.members.get(&user_id).map(|e| e.value().clone()) {
            Some(member) => sessions_used(&*member.read().await, month_start(now_ms())),
            None => 0,
        };
        Ok(Remaining::Sessions { allowed, used })
    }
}
