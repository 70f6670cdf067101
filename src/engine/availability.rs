use crate::model::*;

// ── Interval algebra over whole days ─────────────────────────────

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `base` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Tolerance for summing fractional loads.
const LOAD_EPSILON: f64 = 1e-9;

/// Sweep-line events: `+load` at start, `-load` at end. Ends sort before
/// starts on the same day because spans are half-open.
fn sweep_events(loads: &[(Span, f64)]) -> Vec<(Day, f64)> {
    let mut events: Vec<(Day, f64)> = Vec::with_capacity(loads.len() * 2);
    for (span, load) in loads {
        events.push((span.start, *load));
        events.push((span.end, -*load));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
    events
}

/// Highest simultaneous load on any day.
pub fn peak_load(loads: &[(Span, f64)]) -> f64 {
    let mut current = 0.0_f64;
    let mut peak = 0.0_f64;
    for (_, delta) in sweep_events(loads) {
        current += delta;
        peak = peak.max(current);
    }
    peak
}

/// Day ranges where the summed load is strictly above `capacity`.
pub fn overloaded_spans(loads: &[(Span, f64)], capacity: f64) -> Vec<Span> {
    let mut result = Vec::new();
    let mut current = 0.0_f64;
    let mut over_start: Option<Day> = None;

    for (day, delta) in sweep_events(loads) {
        current += delta;
        let over = current > capacity + LOAD_EPSILON;
        if over && over_start.is_none() {
            over_start = Some(day);
        } else if !over
            && let Some(start) = over_start.take()
            && day > start {
                result.push(Span::new(start, day));
            }
    }

    result
}

/// Sub-windows of `query` not covered by any blackout.
pub fn free_windows(query: &DateWindow, blackouts: &[DateWindow]) -> Vec<DateWindow> {
    let mut blocked: Vec<Span> = blackouts
        .iter()
        .filter_map(|b| b.intersection(query))
        .map(|w| w.to_span())
        .collect();
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);
    subtract_intervals(&[query.to_span()], &blocked)
        .iter()
        .filter_map(Span::to_window)
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn w(start: u32, end: u32) -> DateWindow {
        DateWindow::new(d(start), d(end))
    }

    fn load(start: u32, end: u32, amount: f64) -> (Span, f64) {
        (w(start, end).to_span(), amount)
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn merge_adjacent_days() {
        let spans = vec![Span::new(1, 3), Span::new(3, 5), Span::new(7, 8)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(1, 5), Span::new(7, 8)]
        );
    }

    // ── load sweep ─────────────────────────────────────────

    #[test]
    fn peak_of_overlapping_windows() {
        // 60% on days 1-10, 50% on days 5-15: peak 110 on days 5-10.
        let loads = vec![load(1, 10, 60.0), load(5, 15, 50.0)];
        assert_eq!(peak_load(&loads), 110.0);
        let over = overloaded_spans(&loads, 100.0);
        assert_eq!(over, vec![w(5, 10).to_span()]);
    }

    #[test]
    fn back_to_back_windows_do_not_stack() {
        // Days 1-4 and 5-9 never share a day.
        let loads = vec![load(1, 4, 80.0), load(5, 9, 80.0)];
        assert_eq!(peak_load(&loads), 80.0);
        assert!(overloaded_spans(&loads, 100.0).is_empty());
    }

    #[test]
    fn exact_capacity_is_not_overloaded() {
        let loads = vec![load(1, 10, 40.0), load(1, 10, 60.0)];
        assert_eq!(peak_load(&loads), 100.0);
        assert!(overloaded_spans(&loads, 100.0).is_empty());
    }

    #[test]
    fn point_in_time_accounting_allows_staggered_load() {
        // Three 50% loads, never more than two on the same day.
        let loads = vec![load(1, 5, 50.0), load(6, 10, 50.0), load(3, 8, 50.0)];
        assert_eq!(peak_load(&loads), 100.0);
        assert!(overloaded_spans(&loads, 100.0).is_empty());
    }

    #[test]
    fn fractional_loads_tolerate_rounding() {
        let loads = vec![load(1, 2, 0.1), load(1, 2, 0.2)];
        assert!(overloaded_spans(&loads, 0.3).is_empty());
    }

    #[test]
    fn empty_sweep() {
        assert_eq!(peak_load(&[]), 0.0);
        assert!(overloaded_spans(&[], 1.0).is_empty());
    }

    // ── free_windows ───────────────────────────────────────

    #[test]
    fn free_windows_punch_out_blackouts() {
        let free = free_windows(&w(1, 30), &[w(5, 9), w(8, 12), w(20, 20)]);
        assert_eq!(free, vec![w(1, 4), w(13, 19), w(21, 30)]);
    }

    #[test]
    fn free_windows_clip_to_query() {
        let free = free_windows(&w(10, 15), &[w(1, 11), w(14, 28)]);
        assert_eq!(free, vec![w(12, 13)]);
    }

    #[test]
    fn free_windows_none_when_fully_blocked() {
        assert!(free_windows(&w(3, 4), &[w(1, 10)]).is_empty());
    }
}
