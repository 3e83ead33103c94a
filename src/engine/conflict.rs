use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Half-open overlap test shared by every booking path.
pub fn has_overlap(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

/// Which ledger entries count as occupying time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    /// Confirmed sessions, approved classes, forfeited slots.
    Committed,
    /// Committed plus classes still awaiting approval.
    All,
}

/// Build a span from caller input, rejecting empty, inverted, too-short,
/// too-long and out-of-range intervals.
pub(crate) fn span_from(start: Ms, end: Ms, min_duration: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInterval("end must be after start"));
    }
    let span = Span { start, end };
    if span.duration_ms() < min_duration {
        return Err(EngineError::InvalidInterval("shorter than the minimum duration"));
    }
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.is_empty() {
        return Err(EngineError::InvalidInterval("end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too long"));
    }
    Ok(())
}

/// First entry overlapping `candidate`, ignoring `skip` (an entry being re-checked).
pub(crate) fn find_conflict<'a>(
    entries: &'a Entries,
    candidate: &Span,
    scope: Scope,
    skip: Option<Ulid>,
) -> Option<&'a LedgerEntry> {
    entries.overlapping(candidate).find(|e| {
        Some(e.id) != skip && (scope == Scope::All || e.is_committed())
    })
}

pub(crate) fn check_no_conflict(
    entries: &Entries,
    candidate: &Span,
    scope: Scope,
    skip: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(entries, candidate, scope, skip) {
        Some(entry) => Err(EngineError::Conflict(entry.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const BASE: Ms = 1_767_254_400_000; // 2026-01-01T08:00:00Z

    fn ledger(items: &[(Ms, Ms, EntryKind)]) -> (Entries, Vec<Ulid>) {
        let mut entries = Entries::default();
        let mut ids = Vec::new();
        for &(start, end, kind) in items {
            let id = Ulid::new();
            ids.push(id);
            entries.insert(LedgerEntry { id, span: Span::new(start, end), kind });
        }
        (entries, ids)
    }

    #[test]
    fn overlap_is_symmetric() {
        let spans = [
            Span::new(0, 10),
            Span::new(5, 15),
            Span::new(10, 20),
            Span::new(2, 3),
            Span::new(-5, 0),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(has_overlap(a, b), has_overlap(b, a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn back_to_back_never_overlaps() {
        for (start, mid, end) in [(0, 10, 20), (BASE, BASE + H, BASE + 2 * H), (-100, -1, 5)] {
            assert!(!has_overlap(&Span::new(start, mid), &Span::new(mid, end)));
        }
    }

    #[test]
    fn span_from_rejects_bad_intervals() {
        assert!(matches!(span_from(BASE, BASE, 0), Err(EngineError::InvalidInterval(_))));
        assert!(matches!(span_from(BASE + H, BASE, 0), Err(EngineError::InvalidInterval(_))));
        assert!(matches!(
            span_from(BASE, BASE + 10 * 60_000, 30 * 60_000),
            Err(EngineError::InvalidInterval(_))
        ));
        assert!(matches!(span_from(0, 1000, 0), Err(EngineError::InvalidInterval(_))));
        assert!(matches!(
            span_from(BASE, BASE + 25 * H, 0),
            Err(EngineError::LimitExceeded(_))
        ));
        assert_eq!(span_from(BASE, BASE + H, 30 * 60_000).unwrap(), Span::new(BASE, BASE + H));
    }

    #[test]
    fn pending_classes_only_block_in_all_scope() {
        let (entries, ids) = ledger(&[(BASE, BASE + H, EntryKind::Class { approved: false })]);
        let candidate = Span::new(BASE + H / 2, BASE + 2 * H);
        assert!(find_conflict(&entries, &candidate, Scope::Committed, None).is_none());
        assert_eq!(
            find_conflict(&entries, &candidate, Scope::All, None).map(|e| e.id),
            Some(ids[0])
        );
    }

    #[test]
    fn skip_ignores_own_entry() {
        let (entries, ids) = ledger(&[(BASE, BASE + H, EntryKind::Class { approved: false })]);
        let own = Span::new(BASE, BASE + H);
        assert!(check_no_conflict(&entries, &own, Scope::All, Some(ids[0])).is_ok());
        assert!(check_no_conflict(&entries, &own, Scope::All, None).is_err());
    }

    #[test]
    fn forfeited_slot_still_blocks() {
        let (entries, ids) = ledger(&[(BASE, BASE + H, EntryKind::Forfeited)]);
        match check_no_conflict(&entries, &Span::new(BASE, BASE + H), Scope::Committed, None) {
            Err(EngineError::Conflict(id)) => assert_eq!(id, ids[0]),
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
