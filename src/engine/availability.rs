use crate::model::*;

// ── Free-slot arithmetic ─────────────────────────────────────────

/// Collapse spans sorted by start into disjoint spans. Touching spans join.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for &span in sorted {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// `base` minus `busy`. Both inputs sorted by start; `busy` must be disjoint.
pub fn subtract_intervals(base: &[Span], busy: &[Span]) -> Vec<Span> {
    let mut free = Vec::new();
    let mut first_relevant = 0;

    for &b in base {
        let mut cursor = b.start;
        while first_relevant < busy.len() && busy[first_relevant].end <= cursor {
            first_relevant += 1;
        }
        for r in busy[first_relevant..].iter().take_while(|r| r.start < b.end) {
            if r.start > cursor {
                free.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < b.end {
            free.push(Span::new(cursor, b.end));
        }
    }
    free
}

/// Gaps inside `window` not covered by any of `busy` (unsorted, may overlap,
/// may reach outside the window).
pub fn free_slots(window: Span, busy: impl IntoIterator<Item = Span>) -> Vec<Span> {
    let mut clamped: Vec<Span> = busy
        .into_iter()
        .filter(|s| s.overlaps(&window))
        .map(|s| Span::new(s.start.max(window.start), s.end.min(window.end)))
        .collect();
    clamped.sort_by_key(|s| s.start);
    subtract_intervals(&[window], &merge_overlapping(&clamped))
}
