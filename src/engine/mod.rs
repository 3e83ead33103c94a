mod approval;
mod availability;
mod capacity;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{covers, date_of, day_span, free_slots, merge_overlapping, offered_in, subtract_intervals};
pub use conflict::{has_overlap, now_ms};
pub use error::EngineError;

use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::BookingRules;
use crate::directory::{Directory, Entitlements};
use crate::model::*;
use crate::wal::Wal;

pub type SharedTrainer = Arc<RwLock<TrainerLedger>>;
pub type SharedMember = Arc<RwLock<MemberLedger>>;
pub type SharedClass = Arc<RwLock<ClassState>>;

/// Reason recorded on bookings cancelled because their class was.
pub const CLASS_CANCELLED_REASON: &str = "class cancelled";

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

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Owns the WAL. Appends that arrive while a flush is being prepared share
/// one fsync; any other command first flushes what is already batched.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Pending) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so partial bytes never join the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) trainers: DashMap<Ulid, SharedTrainer>,
    pub(super) members: DashMap<Ulid, SharedMember>,
    pub(super) classes: DashMap<Ulid, SharedClass>,
    /// booking id → owning ledgers.
    pub(super) bookings: DashMap<Ulid, BookingRef>,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot and the log swap see no concurrent appends.
    pub(super) gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) rules: BookingRules,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) entitlements: Arc<dyn Entitlements>,
}

/// Which ledgers an operation writes.
#[derive(Debug, Default, Clone)]
pub(super) struct Footprint {
    pub members: Vec<Ulid>,
    pub trainer: Option<Ulid>,
    /// Second trainer, for a class changing hands.
    pub to_trainer: Option<Ulid>,
    pub class: Option<Ulid>,
}

/// Write guards for one critical section, acquired in a fixed order:
/// gate, members by id, trainers by id, class.
pub(super) struct Locked<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    pub members: Vec<OwnedRwLockWriteGuard<MemberLedger>>,
    pub trainer: Option<OwnedRwLockWriteGuard<TrainerLedger>>,
    pub to_trainer: Option<OwnedRwLockWriteGuard<TrainerLedger>>,
    pub class: Option<OwnedRwLockWriteGuard<ClassState>>,
}

impl Locked<'_> {
    pub fn member(&mut self, id: Ulid) -> Option<&mut MemberLedger> {
        self.members.iter_mut().find(|g| g.id == id).map(|g| &mut **g)
    }
}

impl Engine {
    pub async fn open(
        wal_path: &Path,
        rules: BookingRules,
        directory: Arc<dyn Directory>,
        entitlements: Arc<dyn Entitlements>,
    ) -> io::Result<Self> {
        let replay = Wal::replay(wal_path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                path = %wal_path.display(),
                bytes = replay.discarded_bytes,
                "discarding torn WAL tail"
            );
            Wal::truncate_to(wal_path, replay.valid_bytes)?;
        }
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            trainers: DashMap::new(),
            members: DashMap::new(),
            classes: DashMap::new(),
            bookings: DashMap::new(),
            gate: RwLock::new(()),
            wal_tx,
            rules,
            directory,
            entitlements,
        };

        for event in &replay.events {
            let footprint = engine.footprint(event).await;
            if let Ok(mut locked) = engine.lock(footprint, false).await {
                engine.apply(&mut locked, event);
            }
        }
        debug!(events = replay.events.len(), "replayed WAL");

        Ok(engine)
    }

    pub fn rules(&self) -> &BookingRules {
        &self.rules
    }

    pub(super) fn trainer_ledger(&self, id: Ulid) -> SharedTrainer {
        self.trainers
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(TrainerLedger::new(id))))
            .value()
            .clone()
    }

    pub(super) fn member_ledger(&self, id: Ulid) -> SharedMember {
        self.members
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(MemberLedger::new(id))))
            .value()
            .clone()
    }

    pub(super) fn class_handle(&self, id: &Ulid) -> Option<SharedClass> {
        self.classes.get(id).map(|e| e.value().clone())
    }

    /// Take the write locks for `footprint`. With `strict`, a class that is
    /// missing (or was deleted while we waited) is `NotFound`; otherwise it is
    /// simply left unlocked.
    pub(super) async fn lock(
        &self,
        footprint: Footprint,
        strict: bool,
    ) -> Result<Locked<'_>, EngineError> {
        let gate = self.gate.read().await;

        let mut member_ids = footprint.members;
        member_ids.sort();
        member_ids.dedup();
        let mut members = Vec::with_capacity(member_ids.len());
        for id in member_ids {
            members.push(self.member_ledger(id).write_owned().await);
        }

        let to_trainer_id = footprint.to_trainer.filter(|t| Some(*t) != footprint.trainer);
        let (trainer, to_trainer) = match (footprint.trainer, to_trainer_id) {
            (Some(from), Some(to)) if to < from => {
                let to = self.trainer_ledger(to).write_owned().await;
                let from = self.trainer_ledger(from).write_owned().await;
                (Some(from), Some(to))
            }
            (from, to) => {
                let from = match from {
                    Some(id) => Some(self.trainer_ledger(id).write_owned().await),
                    None => None,
                };
                let to = match to {
                    Some(id) => Some(self.trainer_ledger(id).write_owned().await),
                    None => None,
                };
                (from, to)
            }
        };

        let class = match footprint.class {
            Some(id) => match self.class_handle(&id) {
                Some(handle) => {
                    let guard = handle.clone().write_owned().await;
                    let current = self
                        .classes
                        .get(&id)
                        .is_some_and(|e| Arc::ptr_eq(e.value(), &handle));
                    match (current, strict) {
                        (true, _) => Some(guard),
                        (false, true) => return Err(EngineError::NotFound(id)),
                        (false, false) => None,
                    }
                }
                None if strict => return Err(EngineError::NotFound(id)),
                None => None,
            },
            None => None,
        };

        Ok(Locked {
            _gate: gate,
            members,
            trainer,
            to_trainer,
            class,
        })
    }

    /// Ledgers an event touches. Used on replay; live mutations build their
    /// footprint before validating.
    async fn footprint(&self, event: &Event) -> Footprint {
        match event {
            Event::ClassCreated { trainer_id, .. } | Event::AvailabilitySet { trainer_id, .. } => {
                Footprint {
                    trainer: Some(*trainer_id),
                    ..Footprint::default()
                }
            }
            Event::ClassCancelled { id, trainer_id, .. } => Footprint {
                members: self.roster_members(id).await,
                trainer: Some(*trainer_id),
                class: Some(*id),
                to_trainer: None,
            },
            Event::ClassRescheduled {
                id,
                trainer_id,
                to_trainer,
                ..
            } => Footprint {
                members: self.roster_members(id).await,
                trainer: Some(*trainer_id),
                to_trainer: Some(*to_trainer),
                class: Some(*id),
            },
            Event::ClassApproved { id, trainer_id, .. }
            | Event::ClassRejected { id, trainer_id, .. }
            | Event::ClassCompleted { id, trainer_id, .. }
            | Event::ClassDeleted { id, trainer_id } => Footprint {
                members: Vec::new(),
                trainer: Some(*trainer_id),
                class: Some(*id),
                to_trainer: None,
            },
            Event::BookingConfirmed {
                user_id, trainer_id, target, ..
            } => Footprint {
                members: vec![*user_id],
                trainer: target.is_session().then_some(*trainer_id),
                class: target.class_id(),
                to_trainer: None,
            },
            Event::BookingCancelled { id, user_id, .. }
            | Event::BookingCompleted { id, user_id, .. } => {
                let target = self.bookings.get(id).map(|r| r.target);
                Footprint {
                    members: vec![*user_id],
                    trainer: match target {
                        Some(BookingTarget::Trainer(t)) => Some(t),
                        _ => None,
                    },
                    class: target.and_then(|t| t.class_id()),
                    to_trainer: None,
                }
            }
        }
    }

    /// Users holding a seat in a class right now.
    pub(super) async fn roster_members(&self, class_id: &Ulid) -> Vec<Ulid> {
        let Some(handle) = self.class_handle(class_id) else {
            return Vec::new();
        };
        let roster = handle.read().await.roster.clone();
        roster
            .iter()
            .filter_map(|b| self.bookings.get(b).map(|r| r.user_id))
            .collect()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Durably log the event, then apply it under the caller's locks.
    pub(super) async fn commit(
        &self,
        locked: &mut Locked<'_>,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply(locked, &event);
        Ok(())
    }

    /// Apply an event to locked state. Tolerates missing ledgers so replay of
    /// a log whose referents were deleted later stays total.
    fn apply(&self, locked: &mut Locked<'_>, event: &Event) {
        match event {
            Event::ClassCreated {
                id,
                trainer_id,
                kind,
                name,
                description,
                category,
                span,
                capacity,
                approval,
                at,
            } => {
                if let Some(trainer) = locked.trainer.as_mut()
                    && !matches!(approval, Approval::Rejected { .. })
                {
                    trainer.entries.insert(LedgerEntry {
                        id: *id,
                        span: *span,
                        kind: EntryKind::Class {
                            approved: approval.is_approved(),
                        },
                    });
                }
                let class = ClassState {
                    id: *id,
                    trainer_id: *trainer_id,
                    kind: *kind,
                    name: name.clone(),
                    description: description.clone(),
                    category: category.clone(),
                    span: *span,
                    capacity: *capacity,
                    participants: 0,
                    status: ClassStatus::Active,
                    approval: approval.clone(),
                    roster: Vec::new(),
                    created_at: *at,
                };
                self.classes.insert(*id, Arc::new(RwLock::new(class)));
            }
            Event::ClassApproved { id, by, at, .. } => {
                if let Some(class) = locked.class.as_mut() {
                    class.approval = Approval::Approved { by: *by, at: *at };
                }
                if let Some(trainer) = locked.trainer.as_mut()
                    && let Some(entry) = trainer.entries.get_mut(*id)
                {
                    entry.kind = EntryKind::Class { approved: true };
                }
            }
            Event::ClassRejected { id, by, reason, at, .. } => {
                if let Some(class) = locked.class.as_mut() {
                    class.approval = Approval::Rejected {
                        by: *by,
                        at: *at,
                        reason: reason.clone(),
                    };
                }
                if let Some(trainer) = locked.trainer.as_mut() {
                    trainer.entries.remove(*id);
                }
            }
            Event::ClassCancelled { id, at, .. } => {
                if let Some(trainer) = locked.trainer.as_mut() {
                    trainer.entries.remove(*id);
                }
                let Some(mut class) = locked.class.take() else {
                    return;
                };
                class.status = ClassStatus::Cancelled;
                for booking_id in class.roster.clone() {
                    let Some(user_id) = self.bookings.get(&booking_id).map(|r| r.user_id) else {
                        continue;
                    };
                    let cancelled = locked.member(user_id).and_then(|member| {
                        cancel_record(member, booking_id, Some(CLASS_CANCELLED_REASON.into()), *at)
                    });
                    // Completed bookings keep their seat on the record.
                    if cancelled.is_some() {
                        capacity::release(&mut class, booking_id);
                    }
                }
                locked.class = Some(class);
            }
            Event::ClassCompleted { .. } => {
                if let Some(class) = locked.class.as_mut() {
                    class.status = ClassStatus::Completed;
                }
            }
            Event::ClassRescheduled {
                id, to_trainer, span, ..
            } => {
                let moved = locked.trainer.as_mut().and_then(|t| t.entries.remove(*id));
                if let Some(entry) = moved {
                    let entry = LedgerEntry { span: *span, ..entry };
                    match (locked.to_trainer.as_mut(), locked.trainer.as_mut()) {
                        (Some(ledger), _) | (None, Some(ledger)) => ledger.entries.insert(entry),
                        (None, None) => {}
                    }
                }
                let roster = match locked.class.as_mut() {
                    Some(class) => {
                        class.span = *span;
                        class.trainer_id = *to_trainer;
                        class.roster.clone()
                    }
                    None => return,
                };
                for booking_id in roster {
                    let Some(user_id) = self.bookings.get_mut(&booking_id).map(|mut r| {
                        r.trainer_id = *to_trainer;
                        r.user_id
                    }) else {
                        continue;
                    };
                    let Some(member) = locked.member(user_id) else {
                        continue;
                    };
                    if let Some(entry) = member.entries.remove(booking_id) {
                        member.entries.insert(LedgerEntry { span: *span, ..entry });
                    }
                    if let Some(booking) = member.bookings.get_mut(&booking_id) {
                        booking.span = *span;
                        booking.trainer_id = *to_trainer;
                    }
                }
            }
            Event::ClassDeleted { id, .. } => {
                if let Some(trainer) = locked.trainer.as_mut() {
                    trainer.entries.remove(*id);
                }
                self.classes.remove(id);
            }
            Event::BookingConfirmed {
                id,
                user_id,
                trainer_id,
                target,
                span,
                notes,
                at,
            } => {
                let Some(member) = locked.member(*user_id) else {
                    return;
                };
                let kind = match target {
                    BookingTarget::Trainer(_) => EntryKind::Session,
                    BookingTarget::Class(class_id) => EntryKind::Seat { class_id: *class_id },
                };
                member.entries.insert(LedgerEntry { id: *id, span: *span, kind });
                member.bookings.insert(
                    *id,
                    Booking {
                        id: *id,
                        user_id: *user_id,
                        trainer_id: *trainer_id,
                        target: *target,
                        span: *span,
                        status: BookingStatus::Confirmed,
                        notes: notes.clone(),
                        cancel_reason: None,
                        created_at: *at,
                        cancelled_at: None,
                        completed_at: None,
                    },
                );
                match target {
                    BookingTarget::Trainer(_) => {
                        if let Some(trainer) = locked.trainer.as_mut() {
                            trainer.entries.insert(LedgerEntry {
                                id: *id,
                                span: *span,
                                kind: EntryKind::Session,
                            });
                        }
                    }
                    BookingTarget::Class(_) => {
                        if let Some(class) = locked.class.as_mut() {
                            capacity::reserve(class, *id);
                        }
                    }
                }
                self.bookings.insert(
                    *id,
                    BookingRef {
                        user_id: *user_id,
                        trainer_id: *trainer_id,
                        target: *target,
                    },
                );
            }
            Event::BookingCancelled {
                id,
                user_id,
                reason,
                reoffer,
                at,
            } => {
                let Some(member) = locked.member(*user_id) else {
                    return;
                };
                let Some(target) = cancel_record(member, *id, reason.clone(), *at) else {
                    return;
                };
                match target {
                    BookingTarget::Trainer(_) => {
                        if let Some(trainer) = locked.trainer.as_mut() {
                            if *reoffer {
                                trainer.entries.remove(*id);
                            } else if let Some(entry) = trainer.entries.get_mut(*id) {
                                entry.kind = EntryKind::Forfeited;
                            }
                        }
                    }
                    BookingTarget::Class(_) => {
                        if let Some(class) = locked.class.as_mut() {
                            capacity::release(class, *id);
                        }
                    }
                }
            }
            Event::BookingCompleted { id, user_id, at } => {
                if let Some(member) = locked.member(*user_id)
                    && let Some(booking) = member.bookings.get_mut(id)
                {
                    booking.status = BookingStatus::Completed;
                    booking.completed_at = Some(*at);
                }
            }
            Event::AvailabilitySet {
                date, slots, ..
            } => {
                if let Some(trainer) = locked.trainer.as_mut() {
                    if slots.is_empty() {
                        trainer.availability.remove(date);
                    } else {
                        trainer.availability.insert(*date, slots.clone());
                    }
                }
            }
        }
    }
}

/// Mark a booking cancelled and free its member-ledger slot. Returns the
/// target if the booking was confirmed.
fn cancel_record(
    member: &mut MemberLedger,
    booking_id: Ulid,
    reason: Option<String>,
    at: Ms,
) -> Option<BookingTarget> {
    let booking = member.bookings.get_mut(&booking_id)?;
    if booking.status != BookingStatus::Confirmed {
        return None;
    }
    booking.status = BookingStatus::Cancelled;
    booking.cancelled_at = Some(at);
    booking.cancel_reason = reason;
    let target = booking.target;
    member.entries.remove(booking_id);
    Some(target)
}
