use std::cmp::Ordering;

/// School days, in week order. Sunday is not a school day.
pub const DAYS: [&str; 6] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// The eight canonical period start times. Every period runs 45 minutes,
/// so slot N ends where slot N+1 begins (last slot ends 14:00).
pub const PERIOD_STARTS: [&str; 8] = [
    "08:00", "08:45", "09:30", "10:15", "11:00", "11:45", "12:30", "13:15",
];

pub const MAX_DAILY_PERIODS: usize = 4;

pub fn is_school_day(day: &str) -> bool {
    DAYS.contains(&day)
}

/// Period number (1..=8) for a canonical start time. Unknown start times
/// yield None; callers reject them rather than guessing a slot.
pub fn period_number_for(start_time: &str) -> Option<u8> {
    PERIOD_STARTS
        .iter()
        .position(|s| *s == start_time)
        .map(|i| (i + 1) as u8)
}

/// (start, end) bounds for a period number, if it is in range.
pub fn slot_bounds(period_number: u8) -> Option<(&'static str, &'static str)> {
    if !(1..=8).contains(&period_number) {
        return None;
    }
    let idx = (period_number - 1) as usize;
    let start = PERIOD_STARTS[idx];
    let end = if idx + 1 < PERIOD_STARTS.len() {
        PERIOD_STARTS[idx + 1]
    } else {
        "14:00"
    };
    Some((start, end))
}

/// True when (start, end) is exactly one canonical slot.
pub fn is_canonical_slot(start_time: &str, end_time: &str) -> bool {
    match period_number_for(start_time) {
        Some(n) => slot_bounds(n).map(|(_, e)| e == end_time).unwrap_or(false),
        None => false,
    }
}

/// One occupied time window within a teacher's day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpan {
    pub start_time: String,
    pub end_time: String,
}

impl SlotSpan {
    pub fn new(start_time: impl Into<String>, end_time: impl Into<String>) -> Self {
        SlotSpan {
            start_time: start_time.into(),
            end_time: end_time.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotConflict {
    /// The teacher already holds MAX_DAILY_PERIODS slots that day.
    DailyLimitExceeded,
    /// Two of the teacher's slots would abut (one ends where the next starts).
    ConsecutivePeriods,
}

impl SlotConflict {
    pub fn code(self) -> &'static str {
        match self {
            SlotConflict::DailyLimitExceeded => "daily_limit_exceeded",
            SlotConflict::ConsecutivePeriods => "consecutive_period_conflict",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            SlotConflict::DailyLimitExceeded => {
                "teacher cannot be assigned more than 4 classes per day"
            }
            SlotConflict::ConsecutivePeriods => {
                "teacher cannot be assigned consecutive classes"
            }
        }
    }
}

/// Admission check for one teacher's (day, academic year) group.
///
/// `existing` must already exclude the record being replaced, if the caller
/// is updating a slot in place. The candidate joins the adjacency sort, so
/// a new slot abutting an existing one is refused from either side.
pub fn check_teacher_day(existing: &[SlotSpan], candidate: &SlotSpan) -> Result<(), SlotConflict> {
    if existing.len() >= MAX_DAILY_PERIODS {
        return Err(SlotConflict::DailyLimitExceeded);
    }

    let mut spans: Vec<&SlotSpan> = existing.iter().collect();
    spans.push(candidate);
    spans.sort_by(|a, b| {
        match a.start_time.cmp(&b.start_time) {
            Ordering::Equal => a.end_time.cmp(&b.end_time),
            other => other,
        }
    });

    for pair in spans.windows(2) {
        if pair[0].end_time == pair[1].start_time {
            return Err(SlotConflict::ConsecutivePeriods);
        }
    }

    Ok(())
}
