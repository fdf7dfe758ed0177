//! Interval arithmetic: half-open ranges, day splitting, granularity buckets
//! and the ratios used to normalize usage between time units.
//!
//! Every range here is `[start, end)` in UTC.

use crate::models::{PlanDuration, TimeGranularity};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn duration(&self) -> Duration {
        if self.is_empty() {
            Duration::zero()
        } else {
            self.end - self.start
        }
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let range = TimeRange::new(self.start.max(other.start), self.end.min(other.end));
        (!range.is_empty()).then_some(range)
    }

    /// Calendar days touched by the range.
    pub fn days(&self) -> Vec<NaiveDate> {
        if self.is_empty() {
            return Vec::new();
        }
        let last = (self.end - Duration::nanoseconds(1)).date_naive();
        let mut day = self.start.date_naive();
        let mut days = Vec::new();
        while day <= last {
            days.push(day);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        days
    }
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&t.date_naive().and_time(chrono::NaiveTime::MIN))
}

/// The three pieces of a range around day boundaries. Absent pieces are empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodSplit {
    /// Partial first day, `[start, next midnight)`.
    pub head: Option<TimeRange>,
    /// Whole days, midnight to midnight.
    pub full_days: Option<TimeRange>,
    /// Partial last day, `[last midnight, end)`.
    pub tail: Option<TimeRange>,
}

impl PeriodSplit {
    /// Head and tail, the pieces that must be queried at event resolution.
    pub fn partial_segments(&self) -> impl Iterator<Item = TimeRange> {
        [self.head, self.tail].into_iter().flatten()
    }
}

/// Split a range into a partial head day, whole days and a partial tail day.
pub fn split_period(range: TimeRange) -> PeriodSplit {
    if range.is_empty() {
        return PeriodSplit::default();
    }

    let first_midnight = start_of_day(range.start);
    let first_full = if first_midnight == range.start {
        range.start
    } else {
        first_midnight + Duration::days(1)
    };
    let last_full_end = start_of_day(range.end);

    let non_empty = |start, end| {
        let r = TimeRange::new(start, end);
        (!r.is_empty()).then_some(r)
    };

    if first_full > last_full_end {
        // Starts and ends inside the same day.
        return PeriodSplit {
            head: Some(range),
            ..PeriodSplit::default()
        };
    }

    PeriodSplit {
        head: non_empty(range.start, first_full),
        full_days: non_empty(first_full, last_full_end),
        tail: non_empty(last_full_end.max(first_full), range.end),
    }
}

impl TimeGranularity {
    /// Start of the bucket containing `t`.
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let date = t.date_naive();
        let at = |d: NaiveDate, h: u32, m: u32, s: u32| {
            Utc.from_utc_datetime(&d.and_hms_opt(h, m, s).unwrap_or(d.and_time(chrono::NaiveTime::MIN)))
        };
        let first_of = |year: i32, month: u32| {
            NaiveDate::from_ymd_opt(year, month, 1)
                .map(|d| at(d, 0, 0, 0))
                .unwrap_or(t)
        };
        match self {
            TimeGranularity::Seconds => at(date, t.hour(), t.minute(), t.second()),
            TimeGranularity::Minutes => at(date, t.hour(), t.minute(), 0),
            TimeGranularity::Hours => at(date, t.hour(), 0, 0),
            TimeGranularity::Days => at(date, 0, 0, 0),
            TimeGranularity::Months => first_of(t.year(), t.month()),
            TimeGranularity::Quarters => first_of(t.year(), (t.month0() / 3) * 3 + 1),
            TimeGranularity::Years => first_of(t.year(), 1),
            TimeGranularity::Total => t,
        }
    }

    /// `t` moved one unit later. `Total` has no unit and returns `t`.
    pub fn advance(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeGranularity::Seconds => t + Duration::seconds(1),
            TimeGranularity::Minutes => t + Duration::minutes(1),
            TimeGranularity::Hours => t + Duration::hours(1),
            TimeGranularity::Days => t + Duration::days(1),
            TimeGranularity::Months => t + Months::new(1),
            TimeGranularity::Quarters => t + Months::new(3),
            TimeGranularity::Years => t + Months::new(12),
            TimeGranularity::Total => t,
        }
    }

    /// `t` moved one unit earlier. `Total` has no unit and returns `t`.
    pub fn retreat(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeGranularity::Seconds => t - Duration::seconds(1),
            TimeGranularity::Minutes => t - Duration::minutes(1),
            TimeGranularity::Hours => t - Duration::hours(1),
            TimeGranularity::Days => t - Duration::days(1),
            TimeGranularity::Months => t - Months::new(1),
            TimeGranularity::Quarters => t - Months::new(3),
            TimeGranularity::Years => t - Months::new(12),
            TimeGranularity::Total => t,
        }
    }

    /// Length in seconds of the unit containing `anchor`.
    pub fn span_secs_at(&self, anchor: DateTime<Utc>) -> i64 {
        match self {
            TimeGranularity::Seconds => 1,
            TimeGranularity::Minutes => 60,
            TimeGranularity::Hours => 3_600,
            TimeGranularity::Days => SECONDS_PER_DAY,
            TimeGranularity::Months | TimeGranularity::Quarters | TimeGranularity::Years => {
                let start = self.truncate(anchor);
                (self.advance(start) - start).num_seconds()
            }
            TimeGranularity::Total => 0,
        }
    }

    /// Aligned buckets covering `range`, each clipped to it.
    pub fn buckets(&self, range: TimeRange) -> Vec<TimeRange> {
        if range.is_empty() {
            return Vec::new();
        }
        if *self == TimeGranularity::Total {
            return vec![range];
        }
        let mut buckets = Vec::new();
        let mut cursor = self.truncate(range.start);
        while cursor < range.end {
            let next = self.advance(cursor);
            if let Some(bucket) = TimeRange::new(cursor, next).intersect(&range) {
                buckets.push(bucket);
            }
            cursor = next;
        }
        buckets
    }

    /// Bucket key for `t` within `range`; `Total` collapses to the range start.
    pub fn bucket_key(&self, t: DateTime<Utc>, range: &TimeRange) -> DateTime<Utc> {
        match self {
            TimeGranularity::Total => range.start,
            g => g.truncate(t).max(g.truncate(range.start)),
        }
    }

    /// Nominal ordering check: `self` is no coarser than `other`.
    pub fn is_finer_or_equal(&self, other: &TimeGranularity) -> bool {
        self <= other
    }
}

/// Number of `metric_granularity` units inside one `proration_granularity`
/// unit anchored at `anchor`. Variable-length units use their actual length
/// at the anchor, so a day against a month anchored in February is 1/29 in a
/// leap year.
pub fn granularity_ratio(
    metric_granularity: TimeGranularity,
    proration_granularity: TimeGranularity,
    anchor: DateTime<Utc>,
) -> Decimal {
    if metric_granularity == proration_granularity
        || metric_granularity == TimeGranularity::Total
        || proration_granularity == TimeGranularity::Total
    {
        return Decimal::ONE;
    }
    let proration_span = proration_granularity.span_secs_at(anchor);
    let metric_span = metric_granularity.span_secs_at(anchor);
    if metric_span == 0 {
        return Decimal::ONE;
    }
    Decimal::from(proration_span) / Decimal::from(metric_span)
}

/// End of a subscription period starting at `start`.
pub fn period_end(start: DateTime<Utc>, duration: PlanDuration) -> DateTime<Utc> {
    start + Months::new(duration.months())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn aligned_period_has_only_full_days() {
        let split = split_period(TimeRange::new(ts(2024, 3, 1, 0, 0), ts(2024, 3, 5, 0, 0)));
        assert_eq!(split.head, None);
        assert_eq!(split.tail, None);
        assert_eq!(
            split.full_days,
            Some(TimeRange::new(ts(2024, 3, 1, 0, 0), ts(2024, 3, 5, 0, 0)))
        );
    }

    #[test]
    fn unaligned_period_has_head_full_days_and_tail() {
        let split = split_period(TimeRange::new(ts(2024, 3, 1, 10, 30), ts(2024, 3, 4, 6, 0)));
        assert_eq!(
            split.head,
            Some(TimeRange::new(ts(2024, 3, 1, 10, 30), ts(2024, 3, 2, 0, 0)))
        );
        assert_eq!(
            split.full_days,
            Some(TimeRange::new(ts(2024, 3, 2, 0, 0), ts(2024, 3, 4, 0, 0)))
        );
        assert_eq!(
            split.tail,
            Some(TimeRange::new(ts(2024, 3, 4, 0, 0), ts(2024, 3, 4, 6, 0)))
        );
    }

    #[test]
    fn same_day_period_is_a_single_head() {
        let range = TimeRange::new(ts(2024, 3, 1, 10, 0), ts(2024, 3, 1, 12, 0));
        let split = split_period(range);
        assert_eq!(split.head, Some(range));
        assert_eq!(split.full_days, None);
        assert_eq!(split.tail, None);
    }

    #[test]
    fn adjacent_partial_days_have_no_full_days() {
        let split = split_period(TimeRange::new(ts(2024, 3, 1, 22, 0), ts(2024, 3, 2, 3, 0)));
        assert!(split.head.is_some());
        assert_eq!(split.full_days, None);
        assert_eq!(
            split.tail,
            Some(TimeRange::new(ts(2024, 3, 2, 0, 0), ts(2024, 3, 2, 3, 0)))
        );
    }

    #[test]
    fn split_segments_cover_the_range_exactly() {
        let range = TimeRange::new(ts(2024, 1, 30, 13, 7), ts(2024, 2, 3, 17, 45));
        let split = split_period(range);
        let covered: Duration = [split.head, split.full_days, split.tail]
            .into_iter()
            .flatten()
            .map(|r| r.duration())
            .fold(Duration::zero(), |acc, d| acc + d);
        assert_eq!(covered, range.duration());
    }

    #[test]
    fn ratio_is_one_for_equal_granularities() {
        let anchor = ts(2024, 2, 10, 0, 0);
        assert_eq!(
            granularity_ratio(TimeGranularity::Days, TimeGranularity::Days, anchor),
            Decimal::ONE
        );
    }

    #[test]
    fn day_of_month_ratio_uses_days_in_month() {
        let leap_feb = ts(2024, 2, 10, 0, 0);
        let ratio = granularity_ratio(TimeGranularity::Months, TimeGranularity::Days, leap_feb);
        assert_eq!((ratio * Decimal::from(29)).round_dp(10), Decimal::ONE);
        let april = ts(2024, 4, 10, 0, 0);
        let ratio = granularity_ratio(TimeGranularity::Months, TimeGranularity::Days, april);
        assert_eq!((ratio * Decimal::from(30)).round_dp(10), Decimal::ONE);
    }

    #[test]
    fn hours_in_a_day() {
        let ratio = granularity_ratio(
            TimeGranularity::Hours,
            TimeGranularity::Days,
            ts(2024, 5, 1, 0, 0),
        );
        assert_eq!(ratio, Decimal::from(24));
    }

    #[test]
    fn month_buckets_are_clipped_to_range() {
        let range = TimeRange::new(ts(2024, 1, 15, 0, 0), ts(2024, 3, 10, 0, 0));
        let buckets = TimeGranularity::Months.buckets(range);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].start, ts(2024, 1, 15, 0, 0));
        assert_eq!(buckets[1], TimeRange::new(ts(2024, 2, 1, 0, 0), ts(2024, 3, 1, 0, 0)));
        assert_eq!(buckets[2].end, ts(2024, 3, 10, 0, 0));
    }

    #[test]
    fn quarter_truncation() {
        assert_eq!(
            TimeGranularity::Quarters.truncate(ts(2024, 8, 17, 5, 0)),
            ts(2024, 7, 1, 0, 0)
        );
    }

    #[test]
    fn period_end_adds_plan_months() {
        assert_eq!(
            period_end(ts(2024, 1, 31, 0, 0), PlanDuration::Monthly),
            ts(2024, 2, 29, 0, 0)
        );
        assert_eq!(
            period_end(ts(2024, 1, 1, 0, 0), PlanDuration::Yearly),
            ts(2025, 1, 1, 0, 0)
        );
    }

    #[test]
    fn range_days_excludes_exclusive_end() {
        let range = TimeRange::new(ts(2024, 1, 1, 12, 0), ts(2024, 1, 3, 0, 0));
        assert_eq!(range.days().len(), 2);
    }
}
