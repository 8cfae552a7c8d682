//! Guest daily message quota.
//!
//! Counts are kept per guest id in process memory and reset at the next local
//! midnight, not on a rolling 24h window. Each server process has its own
//! view; nothing is shared across instances or survives a restart.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

pub const DEFAULT_SWEEP_PROBABILITY: f64 = 0.01;

#[derive(Debug, Clone)]
struct UsageRecord {
    count: u32,
    /// Exclusive upper bound of the window
    reset_at: DateTime<Utc>,
}

impl UsageRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// Read view of a guest's quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GuestUsage {
    pub count: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IncrementOutcome {
    pub success: bool,
    pub remaining: u32,
    pub limit: u32,
}

pub struct QuotaTracker {
    limit: u32,
    sweep_probability: f64,
    records: Mutex<HashMap<String, UsageRecord>>,
}

impl QuotaTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Chance per `increment` of reclaiming expired records. Clamped to `[0, 1]`.
    pub fn with_sweep_probability(mut self, probability: f64) -> Self {
        self.sweep_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn usage(&self, guest_id: &str) -> GuestUsage {
        self.usage_at(guest_id, Local::now())
    }

    pub fn usage_at(&self, guest_id: &str, now: DateTime<Local>) -> GuestUsage {
        let now_utc = now.with_timezone(&Utc);
        let records = self.lock();
        match records.get(guest_id).filter(|r| !r.is_expired(now_utc)) {
            Some(record) => GuestUsage {
                count: record.count,
                remaining: self.limit.saturating_sub(record.count),
                reset_at: record.reset_at,
                limit: self.limit,
            },
            None => GuestUsage {
                count: 0,
                remaining: self.limit,
                reset_at: next_midnight(&now),
                limit: self.limit,
            },
        }
    }

    pub fn can_send(&self, guest_id: &str) -> bool {
        self.can_send_at(guest_id, Local::now())
    }

    pub fn can_send_at(&self, guest_id: &str, now: DateTime<Local>) -> bool {
        self.usage_at(guest_id, now).remaining > 0
    }

    /// Check and count one message in a single critical section
    pub fn increment(&self, guest_id: &str) -> IncrementOutcome {
        self.increment_at(guest_id, Local::now())
    }

    pub fn increment_at(&self, guest_id: &str, now: DateTime<Local>) -> IncrementOutcome {
        let now_utc = now.with_timezone(&Utc);
        let mut records = self.lock();

        if self.sweep_probability > 0.0 && rand::random::<f64>() < self.sweep_probability {
            let removed = sweep(&mut records, now_utc);
            if removed > 0 {
                tracing::debug!(removed, "Swept expired guest usage records");
            }
        }

        let outcome = match records.get_mut(guest_id) {
            Some(record) if !record.is_expired(now_utc) => {
                if record.count >= self.limit {
                    IncrementOutcome {
                        success: false,
                        remaining: 0,
                        limit: self.limit,
                    }
                } else {
                    record.count += 1;
                    IncrementOutcome {
                        success: true,
                        remaining: self.limit - record.count,
                        limit: self.limit,
                    }
                }
            }
            _ if self.limit == 0 => IncrementOutcome {
                success: false,
                remaining: 0,
                limit: 0,
            },
            _ => {
                records.insert(
                    guest_id.to_string(),
                    UsageRecord {
                        count: 1,
                        reset_at: next_midnight(&now),
                    },
                );
                IncrementOutcome {
                    success: true,
                    remaining: self.limit - 1,
                    limit: self.limit,
                }
            }
        };

        if !outcome.success {
            tracing::info!(guest_id, limit = self.limit, "Guest quota exhausted");
        }
        outcome
    }

    /// Remove every record whose window has closed; returns how many went
    pub fn sweep_expired_at(&self, now: DateTime<Local>) -> usize {
        sweep(&mut self.lock(), now.with_timezone(&Utc))
    }

    /// Number of records currently held, expired ones included
    pub fn tracked_guests(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UsageRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sweep(records: &mut HashMap<String, UsageRecord>, now: DateTime<Utc>) -> usize {
    let before = records.len();
    records.retain(|_, record| !record.is_expired(now));
    before - records.len()
}

/// Start of the next calendar day in `now`'s time zone, as UTC.
///
/// When that midnight falls inside a DST gap, the first representable local
/// instant after it is used instead.
pub fn next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let tz = now.timezone();
    let Some(midnight) = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
    else {
        return now.with_timezone(&Utc) + Duration::days(1);
    };

    first_valid_instant(&tz, midnight).unwrap_or_else(|| now.with_timezone(&Utc) + Duration::days(1))
}

fn first_valid_instant<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    // DST gaps are at most a few hours wide
    for minutes in 0..=(4 * 60) {
        let candidate = local + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(t) => return Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Timelike};

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .earliest()
            .expect("valid local time")
    }

    fn tracker(limit: u32) -> QuotaTracker {
        QuotaTracker::new(limit).with_sweep_probability(0.0)
    }

    #[test]
    fn test_guest_quota_lifecycle() {
        let quota = tracker(2);
        let now = local(2024, 3, 10, 15, 0);

        assert_eq!(
            quota.increment_at("g1", now),
            IncrementOutcome { success: true, remaining: 1, limit: 2 }
        );
        assert_eq!(
            quota.increment_at("g1", now),
            IncrementOutcome { success: true, remaining: 0, limit: 2 }
        );
        assert_eq!(
            quota.increment_at("g1", now),
            IncrementOutcome { success: false, remaining: 0, limit: 2 }
        );

        let reset_at = quota.usage_at("g1", now).reset_at;
        let after_reset = reset_at.with_timezone(&Local) + Duration::seconds(1);
        assert_eq!(
            quota.increment_at("g1", after_reset),
            IncrementOutcome { success: true, remaining: 1, limit: 2 }
        );
    }

    #[test]
    fn test_limit_increments_all_succeed() {
        let quota = tracker(5);
        let now = local(2024, 6, 1, 9, 30);
        for i in 1..=5 {
            let outcome = quota.increment_at("g", now);
            assert!(outcome.success);
            assert_eq!(outcome.remaining, 5 - i);
        }
        assert!(!quota.increment_at("g", now).success);
        assert!(!quota.can_send_at("g", now));
    }

    #[test]
    fn test_usage_is_virtual_for_unknown_guest() {
        let quota = tracker(3);
        let now = local(2024, 6, 1, 9, 30);

        let usage = quota.usage_at("nobody", now);
        assert_eq!(usage.count, 0);
        assert_eq!(usage.remaining, 3);
        assert_eq!(usage.reset_at, next_midnight(&now));
        assert_eq!(quota.tracked_guests(), 0);
        assert!(quota.can_send_at("nobody", now));
    }

    #[test]
    fn test_expired_record_reads_as_fresh() {
        let quota = tracker(3);
        let day_one = local(2024, 6, 1, 23, 59);
        quota.increment_at("g", day_one);
        quota.increment_at("g", day_one);

        let day_two = local(2024, 6, 2, 0, 1);
        let usage = quota.usage_at("g", day_two);
        assert_eq!(usage.count, 0);
        assert_eq!(usage.remaining, 3);
        // The stale record is still held until an increment or sweep
        assert_eq!(quota.tracked_guests(), 1);
    }

    #[test]
    fn test_window_is_calendar_day_not_rolling() {
        let quota = tracker(1);
        let late = local(2024, 6, 1, 23, 50);
        assert!(quota.increment_at("g", late).success);
        assert!(!quota.increment_at("g", late).success);

        // Twenty minutes later is a new day
        let next_day = local(2024, 6, 2, 0, 10);
        assert!(quota.increment_at("g", next_day).success);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let quota = QuotaTracker::new(10).with_sweep_probability(1.0);
        let yesterday = local(2024, 6, 1, 12, 0);
        let today = local(2024, 6, 2, 12, 0);

        quota.increment_at("stale", yesterday);
        quota.increment_at("live", today);
        assert_eq!(quota.tracked_guests(), 1);
        assert_eq!(quota.usage_at("live", today).count, 1);

        quota.increment_at("live", today);
        assert_eq!(quota.usage_at("live", today).count, 2);
    }

    #[test]
    fn test_sweep_does_not_change_results() {
        let swept = QuotaTracker::new(2).with_sweep_probability(1.0);
        let unswept = tracker(2);
        let times = [
            local(2024, 6, 1, 10, 0),
            local(2024, 6, 1, 11, 0),
            local(2024, 6, 1, 12, 0),
            local(2024, 6, 2, 1, 0),
        ];
        for now in times {
            assert_eq!(swept.increment_at("g", now), unswept.increment_at("g", now));
            assert_eq!(swept.usage_at("g", now), unswept.usage_at("g", now));
        }
    }

    #[test]
    fn test_explicit_sweep_counts_removed() {
        let quota = tracker(4);
        quota.increment_at("a", local(2024, 6, 1, 8, 0));
        quota.increment_at("b", local(2024, 6, 1, 9, 0));
        quota.increment_at("c", local(2024, 6, 2, 9, 0));

        assert_eq!(quota.sweep_expired_at(local(2024, 6, 2, 10, 0)), 2);
        assert_eq!(quota.tracked_guests(), 1);
    }

    #[test]
    fn test_zero_limit_never_admits() {
        let quota = tracker(0);
        let now = local(2024, 6, 1, 8, 0);
        assert_eq!(
            quota.increment_at("g", now),
            IncrementOutcome { success: false, remaining: 0, limit: 0 }
        );
        assert_eq!(quota.tracked_guests(), 0);
    }

    #[test]
    fn test_next_midnight_is_start_of_next_day() {
        let offset = FixedOffset::east_opt(5 * 3600).unwrap();
        let now = offset.with_ymd_and_hms(2024, 2, 28, 17, 45, 12).unwrap();
        let midnight = next_midnight(&now).with_timezone(&offset);
        assert_eq!(midnight, offset.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_next_midnight_at_midnight_moves_a_full_day() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(
            next_midnight(&now),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_midnight_local_has_zero_clock() {
        let now = local(2024, 6, 15, 13, 0);
        let midnight = next_midnight(&now).with_timezone(&Local);
        assert!(midnight > now);
        assert_eq!(midnight.date_naive(), now.date_naive().succ_opt().unwrap());
        assert_eq!((midnight.hour(), midnight.minute()), (0, 0));
    }

    #[test]
    fn test_concurrent_increments_respect_limit() {
        use std::sync::Arc;

        let quota = Arc::new(tracker(50));
        let now = local(2024, 5, 10, 12, 0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let quota = Arc::clone(&quota);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| quota.increment_at("shared", now).success)
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
