use chrono::{Datelike, TimeZone, Utc};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::DependencyPolicy;
use crate::directory::{Allowance, DirectoryError};
use crate::limits::*;
use crate::model::*;

use super::approval::{self, Decision};
use super::availability::{covers, dates_touched, day_span, merge_overlapping, offered_in};
use super::capacity;
use super::conflict::{check_no_conflict, now_ms, span_from, Scope};
use super::{Engine, EngineError, Footprint, Locked};

fn check_text(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// Elapsed entries stay for history but no longer count toward the cap.
fn ensure_room(entries: &Entries, now: Ms, what: &'static str) -> Result<(), EngineError> {
    if entries.live_len(now) >= MAX_ENTRIES_PER_LEDGER {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// First instant of the UTC month containing `now`.
pub(super) fn month_start(now: Ms) -> Ms {
    let Some(today) = super::date_of(now) else {
        return now;
    };
    Utc.with_ymd_and_hms(today.year(), today.month(), 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(now)
}

/// Confirmed or completed personal sessions starting on or after `since`.
pub(super) fn sessions_used(member: &MemberLedger, since: Ms) -> u32 {
    member
        .bookings
        .values()
        .filter(|b| {
            b.target.is_session()
                && b.status != BookingStatus::Cancelled
                && b.span.start >= since
        })
        .count() as u32
}

impl Engine {
    // ── Collaborators ────────────────────────────────────────

    fn dependency_failed(
        &self,
        service: &'static str,
        policy: DependencyPolicy,
        err: DirectoryError,
    ) -> Result<(), EngineError> {
        metrics::counter!(
            crate::observability::DEPENDENCY_FAILURES_TOTAL,
            "service" => service,
            "policy" => policy.as_str()
        )
        .increment(1);
        match policy {
            DependencyPolicy::FailOpen => {
                warn!(service, error = %err, "collaborator unreachable, proceeding (fail_open)");
                Ok(())
            }
            DependencyPolicy::FailClosed => {
                warn!(service, error = %err, "collaborator unreachable, rejecting (fail_closed)");
                Err(EngineError::DependencyUnavailable(service))
            }
        }
    }

    pub(super) async fn verify_user(&self, id: Ulid) -> Result<(), EngineError> {
        match self.directory.user_exists(id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(EngineError::NotFound(id)),
            Err(e) => self.dependency_failed("identity", self.rules.identity_policy, e),
        }
    }

    pub(super) async fn verify_trainer(&self, id: Ulid) -> Result<(), EngineError> {
        match self.directory.trainer_exists(id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(EngineError::NotFound(id)),
            Err(e) => self.dependency_failed("identity", self.rules.identity_policy, e),
        }
    }

    /// `None` when the subscription service is down and the policy lets us proceed.
    pub(super) async fn allowance(&self, user_id: Ulid) -> Result<Option<Allowance>, EngineError> {
        match self.entitlements.session_allowance(user_id).await {
            Ok(allowance) => Ok(Some(allowance)),
            Err(e) => self
                .dependency_failed("entitlement", self.rules.entitlement_policy, e)
                .map(|()| None),
        }
    }

    /// Reserve a booking id in the index before taking ledger locks.
    fn claim_booking_id(&self, id: Ulid, reference: BookingRef) -> Result<(), EngineError> {
        match self.bookings.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(reference);
                Ok(())
            }
        }
    }

    fn settle_claim<T>(&self, id: Ulid, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if result.is_err() {
            self.bookings.remove(&id);
        }
        result
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Book a personal-training session.
    pub async fn book_session(&self, req: SessionRequest) -> Result<Booking, EngineError> {
        let span = span_from(req.start, req.end, self.rules.min_session_ms)?;
        check_text(req.notes.as_deref(), MAX_TEXT_LEN, "notes too long")?;

        self.verify_user(req.user_id).await?;
        self.verify_trainer(req.trainer_id).await?;
        let allowance = self.allowance(req.user_id).await?;
        if allowance == Some(Allowance::Inactive) {
            return Err(EngineError::SubscriptionInactive);
        }

        self.claim_booking_id(
            req.id,
            BookingRef {
                user_id: req.user_id,
                trainer_id: req.trainer_id,
                target: BookingTarget::Trainer(req.trainer_id),
            },
        )?;
        let result = self.book_session_locked(&req, span, allowance).await;
        self.settle_claim(req.id, result)
    }

    async fn book_session_locked(
        &self,
        req: &SessionRequest,
        span: Span,
        allowance: Option<Allowance>,
    ) -> Result<Booking, EngineError> {
        let footprint = Footprint {
            members: vec![req.user_id],
            trainer: Some(req.trainer_id),
            class: None,
            to_trainer: None,
        };
        let mut locked = self.lock(footprint, true).await?;
        let now = now_ms();

        let trainer = locked
            .trainer
            .as_ref()
            .ok_or(EngineError::NotFound(req.trainer_id))?;
        let enforce = self.rules.require_availability
            || dates_touched(&span)
                .iter()
                .any(|d| trainer.availability.contains_key(d));
        if enforce && !covers(&offered_in(&trainer.availability, &span), &span) {
            return Err(EngineError::OutsideAvailability);
        }
        check_no_conflict(&trainer.entries, &span, Scope::Committed, None)?;
        ensure_room(&trainer.entries, now, "trainer ledger full")?;

        let member = locked
            .member(req.user_id)
            .ok_or(EngineError::NotFound(req.user_id))?;
        check_no_conflict(&member.entries, &span, Scope::All, None)?;
        ensure_room(&member.entries, now, "member ledger full")?;
        if let Some(Allowance::PerMonth(allowed)) = allowance
            && sessions_used(member, month_start(now)) >= allowed
        {
            return Err(EngineError::SessionLimitReached(allowed));
        }

        let event = Event::BookingConfirmed {
            id: req.id,
            user_id: req.user_id,
            trainer_id: req.trainer_id,
            target: BookingTarget::Trainer(req.trainer_id),
            span,
            notes: req.notes.clone(),
            at: now,
        };
        self.commit(&mut locked, event).await?;
        debug!(booking = %req.id, trainer = %req.trainer_id, "session booked");
        booking_in(&mut locked, req.user_id, req.id)
    }

    /// Take a seat in a group class or workout schedule.
    pub async fn book_class(
        &self,
        id: Ulid,
        user_id: Ulid,
        class_id: Ulid,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_text(notes.as_deref(), MAX_TEXT_LEN, "notes too long")?;
        self.verify_user(user_id).await?;

        let handle = self
            .class_handle(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let trainer_id = handle.read().await.trainer_id;

        self.claim_booking_id(
            id,
            BookingRef {
                user_id,
                trainer_id,
                target: BookingTarget::Class(class_id),
            },
        )?;
        let result = self.book_class_locked(id, user_id, class_id, notes).await;
        self.settle_claim(id, result)
    }

    async fn book_class_locked(
        &self,
        id: Ulid,
        user_id: Ulid,
        class_id: Ulid,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        let footprint = Footprint {
            members: vec![user_id],
            trainer: None,
            class: Some(class_id),
            to_trainer: None,
        };
        let mut locked = self.lock(footprint, true).await?;

        let class = locked.class.as_ref().ok_or(EngineError::NotFound(class_id))?;
        let (span, trainer_id) = (class.span, class.trainer_id);

        let member = locked.member(user_id).ok_or(EngineError::NotFound(user_id))?;
        check_no_conflict(&member.entries, &span, Scope::All, None)?;
        ensure_room(&member.entries, now_ms(), "member ledger full")?;

        let class = locked.class.as_ref().ok_or(EngineError::NotFound(class_id))?;
        capacity::try_reserve(class)?;

        let event = Event::BookingConfirmed {
            id,
            user_id,
            trainer_id,
            target: BookingTarget::Class(class_id),
            span,
            notes,
            at: now_ms(),
        };
        self.commit(&mut locked, event).await?;
        debug!(booking = %id, class = %class_id, "class seat booked");
        booking_in(&mut locked, user_id, id)
    }

    fn booking_footprint(&self, id: Ulid) -> Result<(BookingRef, Footprint), EngineError> {
        let reference = *self.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        let footprint = Footprint {
            members: vec![reference.user_id],
            trainer: match reference.target {
                BookingTarget::Trainer(t) => Some(t),
                BookingTarget::Class(_) => None,
            },
            class: reference.target.class_id(),
            to_trainer: None,
        };
        Ok((reference, footprint))
    }

    /// Cancel a confirmed booking. Personal sessions must be cancelled at
    /// least the configured lead time before they start.
    pub async fn cancel_booking(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_text(reason.as_deref(), MAX_TEXT_LEN, "reason too long")?;
        let (reference, footprint) = self.booking_footprint(id)?;
        let mut locked = self.lock(footprint, false).await?;
        let now = now_ms();

        let booking = booking_in(&mut locked, reference.user_id, id)?;
        match booking.status {
            BookingStatus::Cancelled => return Err(EngineError::AlreadyCancelled(id)),
            BookingStatus::Completed => return Err(EngineError::AlreadyCompleted(id)),
            BookingStatus::Confirmed => {}
        }
        let lead = self.rules.cancel_lead_time_ms;
        if booking.target.is_session() && booking.span.start - now < lead {
            return Err(EngineError::TooLate(id, lead / 3_600_000));
        }
        // A finished class keeps its attendance as recorded.
        if let Some(class) = locked.class.as_deref()
            && class.status == ClassStatus::Completed
        {
            return Err(EngineError::AlreadyCompleted(class.id));
        }

        let event = Event::BookingCancelled {
            id,
            user_id: reference.user_id,
            reason,
            reoffer: !booking.target.is_session() || self.rules.reoffer_cancelled_sessions,
            at: now,
        };
        self.commit(&mut locked, event).await?;
        debug!(booking = %id, "booking cancelled");
        booking_in(&mut locked, reference.user_id, id)
    }

    /// Mark a confirmed booking as attended. Its time stays occupied.
    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (reference, footprint) = self.booking_footprint(id)?;
        let mut locked = self.lock(footprint, false).await?;

        let booking = booking_in(&mut locked, reference.user_id, id)?;
        match booking.status {
            BookingStatus::Cancelled => return Err(EngineError::AlreadyCancelled(id)),
            BookingStatus::Completed => return Err(EngineError::AlreadyCompleted(id)),
            BookingStatus::Confirmed => {}
        }

        let event = Event::BookingCompleted {
            id,
            user_id: reference.user_id,
            at: now_ms(),
        };
        self.commit(&mut locked, event).await?;
        booking_in(&mut locked, reference.user_id, id)
    }

    // ── Classes and schedules ────────────────────────────────

    fn validate_class(&self, class: &NewClass) -> Result<Span, EngineError> {
        if class.name.is_empty() || class.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name must be 1..=200 bytes"));
        }
        check_text(class.description.as_deref(), MAX_TEXT_LEN, "description too long")?;
        check_text(class.category.as_deref(), MAX_NAME_LEN, "category too long")?;
        if class.capacity == 0 || class.capacity > MAX_CAPACITY {
            return Err(EngineError::InvalidCapacity(class.capacity));
        }
        span_from(class.start, class.end, self.rules.min_class_ms)
    }

    async fn insert_class(&self, class: NewClass, approval: Approval) -> Result<ClassState, EngineError> {
        let span = self.validate_class(&class)?;
        self.verify_trainer(class.trainer_id).await?;
        // Proposals only need to avoid committed time; direct creations also
        // avoid proposals still awaiting a decision.
        let scope = if approval.is_pending() {
            Scope::Committed
        } else {
            Scope::All
        };

        let footprint = Footprint {
            members: Vec::new(),
            trainer: Some(class.trainer_id),
            class: None,
            to_trainer: None,
        };
        let mut locked = self.lock(footprint, true).await?;
        if self.classes.contains_key(&class.id) {
            return Err(EngineError::AlreadyExists(class.id));
        }
        let trainer = locked
            .trainer
            .as_ref()
            .ok_or(EngineError::NotFound(class.trainer_id))?;
        check_no_conflict(&trainer.entries, &span, scope, None)?;
        ensure_room(&trainer.entries, now_ms(), "trainer ledger full")?;

        let id = class.id;
        let event = Event::ClassCreated {
            id,
            trainer_id: class.trainer_id,
            kind: class.kind,
            name: class.name,
            description: class.description,
            category: class.category,
            span,
            capacity: class.capacity,
            approval,
            at: now_ms(),
        };
        self.commit(&mut locked, event).await?;
        drop(locked);
        self.get_class(id).await
    }

    /// Create a group class or an admin schedule; it is bookable immediately.
    pub async fn create_class(&self, class: NewClass) -> Result<ClassState, EngineError> {
        let approval = Approval::Approved {
            by: None,
            at: now_ms(),
        };
        self.insert_class(class, approval).await
    }

    /// A trainer proposes a workout schedule; it waits for approval.
    pub async fn propose_schedule(
        &self,
        mut class: NewClass,
        notes: Option<String>,
    ) -> Result<ClassState, EngineError> {
        check_text(notes.as_deref(), MAX_TEXT_LEN, "notes too long")?;
        class.kind = ClassKind::WorkoutSchedule;
        let approval = Approval::Pending {
            proposed_by: class.trainer_id,
            notes,
        };
        self.insert_class(class, approval).await
    }

    /// Lock a class together with its trainer's ledger.
    async fn lock_class(&self, id: Ulid) -> Result<Locked<'_>, EngineError> {
        let handle = self.class_handle(&id).ok_or(EngineError::NotFound(id))?;
        let trainer_id = handle.read().await.trainer_id;
        let footprint = Footprint {
            members: Vec::new(),
            trainer: Some(trainer_id),
            class: Some(id),
            to_trainer: None,
        };
        self.lock(footprint, true).await
    }

    /// Approve a pending schedule after re-checking it against everything the
    /// trainer has committed to since it was proposed.
    pub async fn approve_schedule(&self, id: Ulid, by: Option<Ulid>) -> Result<ClassState, EngineError> {
        let mut locked = self.lock_class(id).await?;
        let class = locked.class.as_ref().ok_or(EngineError::NotFound(id))?;
        let now = now_ms();
        approval::transition(id, &class.approval, Decision::Approve { by, at: now })?;
        if class.status != ClassStatus::Active {
            return Err(EngineError::Inactive(id));
        }
        let (span, trainer_id) = (class.span, class.trainer_id);
        let trainer = locked.trainer.as_ref().ok_or(EngineError::NotFound(trainer_id))?;
        check_no_conflict(&trainer.entries, &span, Scope::Committed, Some(id))?;

        self.commit(&mut locked, Event::ClassApproved { id, trainer_id, by, at: now })
            .await?;
        class_in(&locked, id)
    }

    pub async fn reject_schedule(
        &self,
        id: Ulid,
        by: Option<Ulid>,
        reason: Option<String>,
    ) -> Result<ClassState, EngineError> {
        check_text(reason.as_deref(), MAX_TEXT_LEN, "reason too long")?;
        let mut locked = self.lock_class(id).await?;
        let class = locked.class.as_ref().ok_or(EngineError::NotFound(id))?;
        let now = now_ms();
        let decision = Decision::Reject { by, at: now, reason: reason.clone() };
        approval::transition(id, &class.approval, decision)?;
        let trainer_id = class.trainer_id;

        let event = Event::ClassRejected { id, trainer_id, by, reason, at: now };
        self.commit(&mut locked, event).await?;
        class_in(&locked, id)
    }

    /// Cancel a class and every confirmed booking on it. Returns how many
    /// bookings were cancelled.
    pub async fn cancel_class(&self, id: Ulid) -> Result<usize, EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            let handle = self.class_handle(&id).ok_or(EngineError::NotFound(id))?;
            let (trainer_id, roster) = {
                let class = handle.read().await;
                ensure_active(&class)?;
                (class.trainer_id, class.roster.clone())
            };
            let members = roster
                .iter()
                .filter_map(|b| self.bookings.get(b).map(|r| r.user_id))
                .collect();
            let footprint = Footprint {
                members,
                trainer: Some(trainer_id),
                class: Some(id),
                to_trainer: None,
            };
            let mut locked = self.lock(footprint, true).await?;
            let class = locked.class.as_ref().ok_or(EngineError::NotFound(id))?;
            if class.roster != roster {
                // Roster moved between the snapshot and the locks.
                continue;
            }
            ensure_active(class)?;

            let event = Event::ClassCancelled { id, trainer_id, at: now_ms() };
            self.commit(&mut locked, event).await?;
            let kept = locked.class.as_ref().map_or(0, |c| c.roster.len());
            let cancelled = roster.len() - kept;
            debug!(class = %id, bookings = cancelled, "class cancelled");
            return Ok(cancelled);
        }
        Err(EngineError::LimitExceeded("class roster kept changing during cancellation"))
    }

    pub async fn complete_class(&self, id: Ulid) -> Result<ClassState, EngineError> {
        let mut locked = self.lock_class(id).await?;
        let class = locked.class.as_ref().ok_or(EngineError::NotFound(id))?;
        ensure_active(class)?;
        if !class.approval.is_approved() {
            return Err(EngineError::Inactive(id));
        }
        let trainer_id = class.trainer_id;
        self.commit(&mut locked, Event::ClassCompleted { id, trainer_id, at: now_ms() })
            .await?;
        class_in(&locked, id)
    }

    /// Move an active class to a new time, and optionally to another trainer.
    /// The trainer's ledger and every participant's ledger must be free at
    /// the new time; the class's own old slot does not count against it.
    pub async fn reschedule_class(
        &self,
        id: Ulid,
        start: Ms,
        end: Ms,
        trainer_id: Option<Ulid>,
    ) -> Result<ClassState, EngineError> {
        let span = span_from(start, end, self.rules.min_class_ms)?;
        if let Some(to) = trainer_id {
            self.verify_trainer(to).await?;
        }

        for _ in 0..MAX_LOCK_RETRIES {
            let handle = self.class_handle(&id).ok_or(EngineError::NotFound(id))?;
            let (from, roster) = {
                let class = handle.read().await;
                (class.trainer_id, class.roster.clone())
            };
            let to = trainer_id.unwrap_or(from);
            let members = roster
                .iter()
                .filter_map(|b| self.bookings.get(b).map(|r| r.user_id))
                .collect();
            let footprint = Footprint {
                members,
                trainer: Some(from),
                to_trainer: Some(to),
                class: Some(id),
            };
            let mut locked = self.lock(footprint, true).await?;
            let class = locked.class.as_ref().ok_or(EngineError::NotFound(id))?;
            if class.roster != roster || class.trainer_id != from {
                continue;
            }
            ensure_active(class)?;
            if matches!(class.approval, Approval::Rejected { .. }) {
                return Err(EngineError::Inactive(id));
            }
            // Same rule as creation: proposals only avoid committed time.
            let scope = if class.approval.is_pending() {
                Scope::Committed
            } else {
                Scope::All
            };

            let target = match locked.to_trainer.as_ref() {
                Some(ledger) => ledger,
                None => locked.trainer.as_ref().ok_or(EngineError::NotFound(from))?,
            };
            check_no_conflict(&target.entries, &span, scope, Some(id))?;
            if to != from {
                ensure_room(&target.entries, now_ms(), "trainer ledger full")?;
            }
            for booking_id in &roster {
                let Some(user_id) = self.bookings.get(booking_id).map(|r| r.user_id) else {
                    continue;
                };
                if let Some(member) = locked.member(user_id) {
                    check_no_conflict(&member.entries, &span, Scope::All, Some(*booking_id))?;
                }
            }

            let event = Event::ClassRescheduled {
                id,
                trainer_id: from,
                to_trainer: to,
                span,
                at: now_ms(),
            };
            self.commit(&mut locked, event).await?;
            debug!(class = %id, trainer = %to, "class rescheduled");
            return class_in(&locked, id);
        }
        Err(EngineError::LimitExceeded("class roster kept changing during reschedule"))
    }

    /// Remove a class outright. Only allowed while nobody holds a seat.
    pub async fn delete_class(&self, id: Ulid) -> Result<(), EngineError> {
        let mut locked = self.lock_class(id).await?;
        let class = locked.class.as_ref().ok_or(EngineError::NotFound(id))?;
        if class.participants > 0 {
            return Err(EngineError::HasParticipants(id, class.participants));
        }
        let trainer_id = class.trainer_id;
        self.commit(&mut locked, Event::ClassDeleted { id, trainer_id }).await
    }

    // ── Availability ─────────────────────────────────────────

    /// Replace a trainer's offered slots for one UTC date. An empty list
    /// clears the date.
    pub async fn set_availability(
        &self,
        trainer_id: Ulid,
        date: chrono::NaiveDate,
        slots: Vec<(Ms, Ms)>,
    ) -> Result<Vec<Span>, EngineError> {
        if slots.len() > MAX_SLOTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many slots for one day"));
        }
        let day = day_span(date);
        let mut spans = Vec::with_capacity(slots.len());
        for (start, end) in slots {
            let span = span_from(start, end, 0)?;
            if !day.contains_span(&span) {
                return Err(EngineError::InvalidInterval("slot falls outside its date"));
            }
            spans.push(span);
        }
        spans.sort_by_key(|s| s.start);
        let spans = merge_overlapping(&spans);

        self.verify_trainer(trainer_id).await?;
        let footprint = Footprint {
            members: Vec::new(),
            trainer: Some(trainer_id),
            class: None,
            to_trainer: None,
        };
        let mut locked = self.lock(footprint, true).await?;
        let event = Event::AvailabilitySet {
            trainer_id,
            date,
            slots: spans.clone(),
        };
        self.commit(&mut locked, event).await?;
        Ok(spans)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the log as the minimal event set that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _exclusive = self.gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(super::WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(count)
    }

    /// Caller holds the gate exclusively, so no ledger is mid-mutation.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut classes = Vec::new();
        let handles: Vec<_> = self.classes.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            classes.push(handle.read().await.clone());
        }
        classes.sort_by_key(|c| (c.created_at, c.id));

        let mut created = Vec::with_capacity(classes.len());
        let mut class_final = Vec::new();
        for class in classes {
            let (id, trainer_id) = (class.id, class.trainer_id);
            match class.status {
                ClassStatus::Active => {}
                ClassStatus::Cancelled => class_final.push(Event::ClassCancelled { id, trainer_id, at: 0 }),
                ClassStatus::Completed => class_final.push(Event::ClassCompleted { id, trainer_id, at: 0 }),
            }
            created.push(Event::ClassCreated {
                id,
                trainer_id,
                kind: class.kind,
                name: class.name,
                description: class.description,
                category: class.category,
                span: class.span,
                capacity: class.capacity,
                approval: class.approval,
                at: class.created_at,
            });
        }

        let mut bookings = Vec::new();
        let members: Vec<_> = self.members.iter().map(|e| e.value().clone()).collect();
        for member in members {
            let member = member.read().await;
            bookings.extend(member.bookings.values().cloned());
        }
        bookings.sort_by_key(|b| (b.created_at, b.id));

        let mut confirmed = Vec::with_capacity(bookings.len());
        let mut outcomes = Vec::new();
        for b in &bookings {
            confirmed.push(Event::BookingConfirmed {
                id: b.id,
                user_id: b.user_id,
                trainer_id: b.trainer_id,
                target: b.target,
                span: b.span,
                notes: b.notes.clone(),
                at: b.created_at,
            });
            match b.status {
                BookingStatus::Confirmed => {}
                BookingStatus::Cancelled => {
                    let reoffer = match b.target {
                        BookingTarget::Trainer(t) => self.session_slot_released(t, b.id).await,
                        BookingTarget::Class(_) => true,
                    };
                    outcomes.push(Event::BookingCancelled {
                        id: b.id,
                        user_id: b.user_id,
                        reason: b.cancel_reason.clone(),
                        reoffer,
                        at: b.cancelled_at.unwrap_or(b.created_at),
                    });
                }
                BookingStatus::Completed => outcomes.push(Event::BookingCompleted {
                    id: b.id,
                    user_id: b.user_id,
                    at: b.completed_at.unwrap_or(b.created_at),
                }),
            }
        }

        let mut availability = Vec::new();
        let trainers: Vec<_> = self.trainers.iter().map(|e| e.value().clone()).collect();
        for trainer in trainers {
            let trainer = trainer.read().await;
            for (date, slots) in &trainer.availability {
                availability.push(Event::AvailabilitySet {
                    trainer_id: trainer.id,
                    date: *date,
                    slots: slots.clone(),
                });
            }
        }

        let mut events = created;
        events.extend(confirmed);
        events.extend(outcomes);
        events.extend(class_final);
        events.extend(availability);
        events
    }

    /// Whether a cancelled session's slot went back on offer.
    async fn session_slot_released(&self, trainer_id: Ulid, booking_id: Ulid) -> bool {
        match self.trainers.get(&trainer_id).map(|e| e.value().clone()) {
            Some(trainer) => trainer.read().await.entries.get(booking_id).is_none(),
            None => true,
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn ensure_active(class: &ClassState) -> Result<(), EngineError> {
    match class.status {
        ClassStatus::Active => Ok(()),
        ClassStatus::Cancelled => Err(EngineError::AlreadyCancelled(class.id)),
        ClassStatus::Completed => Err(EngineError::AlreadyCompleted(class.id)),
    }
}

fn booking_in(locked: &mut Locked<'_>, user_id: Ulid, id: Ulid) -> Result<Booking, EngineError> {
    locked
        .member(user_id)
        .and_then(|m| m.bookings.get(&id).cloned())
        .ok_or(EngineError::NotFound(id))
}

fn class_in(locked: &Locked<'_>, id: Ulid) -> Result<ClassState, EngineError> {
    locked
        .class
        .as_deref()
        .cloned()
        .ok_or(EngineError::NotFound(id))
}
