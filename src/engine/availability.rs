use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate};

use crate::model::*;

// ── Offered availability vs. booked time ─────────────────────────

/// UTC calendar date containing `ms`.
pub fn date_of(ms: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

/// `[date 00:00, next day 00:00)` in UTC.
pub fn day_span(date: NaiveDate) -> Span {
    let start = date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis();
    Span::new(start, start + 86_400_000)
}

/// Dates a span touches, first and last inclusive.
pub(crate) fn dates_touched(span: &Span) -> Vec<NaiveDate> {
    let (Some(first), Some(last)) = (date_of(span.start), date_of(span.end - 1)) else {
        return Vec::new();
    };
    first.iter_days().take_while(|d| *d <= last).collect()
}

/// Offered slots inside `window`, clamped, sorted and merged.
pub fn offered_in(availability: &BTreeMap<NaiveDate, Vec<Span>>, window: &Span) -> Vec<Span> {
    let (Some(first), Some(last)) = (date_of(window.start), date_of(window.end - 1)) else {
        return Vec::new();
    };
    let mut spans: Vec<Span> = availability
        .range(first..=last)
        .flat_map(|(_, slots)| slots.iter())
        .filter_map(|s| s.clamp_to(window))
        .collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// True if one merged offered slot contains all of `span`.
pub fn covers(offered: &[Span], span: &Span) -> bool {
    offered.iter().any(|o| o.contains_span(span))
}

/// Offered time in `window` minus busy time, keeping gaps of at least `min_duration`.
pub fn free_slots(offered: &[Span], busy: &[Span], min_duration: Ms) -> Vec<Span> {
    let mut busy = busy.to_vec();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    subtract_intervals(offered, &busy)
        .into_iter()
        .filter(|s| s.duration_ms() >= min_duration)
        .collect()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
