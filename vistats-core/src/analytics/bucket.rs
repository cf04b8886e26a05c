//! Time-grid bucketing for charts

use crate::keys::from_nanos;
use crate::Timestamp;
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_HOUR: i64 = 3600 * NANOS_PER_SEC;

/// Granularity of a bucket grid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    Hour,
    #[default]
    Day,
    Week,
    Month,
}

impl BucketType {
    /// Parse a granularity token; anything unrecognized means `Day`
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hour" => BucketType::Hour,
            "week" => BucketType::Week,
            "month" => BucketType::Month,
            _ => BucketType::Day,
        }
    }

    /// Canonical start (local wall time) of the bucket holding `t`
    fn truncate(&self, t: &DateTime<Tz>) -> NaiveDateTime {
        let date = t.date_naive();
        let day = match self {
            BucketType::Hour => {
                return date.and_hms_opt(t.hour(), 0, 0).unwrap_or_default();
            }
            BucketType::Day => date,
            BucketType::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            BucketType::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date),
        };
        day.and_hms_opt(0, 0, 0).unwrap_or_default()
    }

    /// Start of the following bucket (local wall time)
    fn step(&self, start: NaiveDateTime) -> NaiveDateTime {
        match self {
            BucketType::Hour => start + Duration::hours(1),
            BucketType::Day => start + Duration::days(1),
            BucketType::Week => start + Duration::days(7),
            BucketType::Month => {
                let (y, m) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                NaiveDate::from_ymd_opt(y, m, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .unwrap_or(start + Duration::days(31))
            }
        }
    }
}

/// One slot of a bucket grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSum {
    /// Bucket start, Unix seconds
    pub bucket: i64,
    pub count: u64,
}

/// Resolve an IANA zone name; empty means UTC, unknown names fall back to UTC
pub fn resolve_timezone(name: &str) -> Tz {
    if name.is_empty() {
        return Tz::UTC;
    }
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(e) => {
            warn!("Invalid timezone {:?}, using UTC: {}", name, e);
            Tz::UTC
        }
    }
}

/// Map a local wall time to an instant, resolving DST gaps and overlaps
fn localize(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive)),
    }
}

fn nanos<T: TimeZone>(t: &DateTime<T>) -> Timestamp {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Counts timestamps into a gap-free grid over `[begin, end)`
#[derive(Debug)]
pub struct BucketGen {
    begin: Timestamp,
    end: Timestamp,
    /// Bucket starts in nanoseconds, ascending
    starts: Vec<Timestamp>,
    counts: Vec<u64>,
}

impl BucketGen {
    pub fn new(bucket_type: BucketType, begin: Timestamp, end: Timestamp, timezone: &str) -> Self {
        let tz = resolve_timezone(timezone);
        let mut starts = Vec::new();

        if begin < end {
            let local_begin = from_nanos(begin).with_timezone(&tz);
            let mut naive = bucket_type.truncate(&local_begin);
            let mut start = nanos(&localize(&tz, naive));
            while start < end {
                if starts.last().map_or(true, |last| start > *last) {
                    starts.push(start);
                }
                if bucket_type == BucketType::Hour {
                    // absolute steps keep DST transitions from repeating or skipping hours
                    start += NANOS_PER_HOUR;
                } else {
                    naive = bucket_type.step(naive);
                    start = nanos(&localize(&tz, naive));
                }
            }
        }

        let counts = vec![0; starts.len()];
        Self {
            begin,
            end,
            starts,
            counts,
        }
    }

    /// Count `t`; ignored outside `[begin, end)`
    pub fn add(&mut self, t: Timestamp) {
        if t < self.begin || t >= self.end {
            return;
        }
        let idx = self.starts.partition_point(|s| *s <= t);
        if idx > 0 {
            self.counts[idx - 1] += 1;
        }
    }

    /// Finish the grid, ascending by start
    pub fn close(self) -> Vec<BucketSum> {
        self.starts
            .into_iter()
            .zip(self.counts)
            .map(|(start, count)| BucketSum {
                bucket: start.div_euclid(NANOS_PER_SEC),
                count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::to_nanos;
    use chrono::Utc;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> Timestamp {
        to_nanos(Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap())
    }

    fn secs(t: Timestamp) -> i64 {
        t / NANOS_PER_SEC
    }

    #[test]
    fn test_parse_bucket_type() {
        assert_eq!(BucketType::parse("hour"), BucketType::Hour);
        assert_eq!(BucketType::parse("WEEK"), BucketType::Week);
        assert_eq!(BucketType::parse("month"), BucketType::Month);
        assert_eq!(BucketType::parse("day"), BucketType::Day);
        assert_eq!(BucketType::parse("fortnight"), BucketType::Day);
    }

    #[test]
    fn test_day_grid_includes_empty_buckets() {
        let mut bg = BucketGen::new(
            BucketType::Day,
            utc(2024, 1, 1, 0, 0),
            utc(2024, 1, 8, 0, 0),
            "UTC",
        );
        bg.add(utc(2024, 1, 1, 10, 0));
        bg.add(utc(2024, 1, 3, 23, 59));
        bg.add(utc(2024, 1, 3, 0, 0));
        bg.add(utc(2024, 1, 8, 0, 0));
        bg.add(utc(2023, 12, 31, 23, 0));

        let sums = bg.close();
        assert_eq!(sums.len(), 7);
        for (i, sum) in sums.iter().enumerate() {
            assert_eq!(sum.bucket, secs(utc(2024, 1, 1, 0, 0)) + i as i64 * 86_400);
        }
        let counts: Vec<u64> = sums.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![1, 0, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_first_bucket_is_truncated() {
        let sums = BucketGen::new(
            BucketType::Day,
            utc(2024, 1, 1, 12, 0),
            utc(2024, 1, 3, 0, 0),
            "",
        )
        .close();
        let starts: Vec<i64> = sums.iter().map(|s| s.bucket).collect();
        assert_eq!(starts, vec![secs(utc(2024, 1, 1, 0, 0)), secs(utc(2024, 1, 2, 0, 0))]);
    }

    #[test]
    fn test_week_and_month_grids() {
        // 2024-01-03 is a Wednesday
        let weeks = BucketGen::new(
            BucketType::Week,
            utc(2024, 1, 3, 0, 0),
            utc(2024, 1, 20, 0, 0),
            "UTC",
        )
        .close();
        let starts: Vec<i64> = weeks.iter().map(|s| s.bucket).collect();
        assert_eq!(
            starts,
            vec![
                secs(utc(2024, 1, 1, 0, 0)),
                secs(utc(2024, 1, 8, 0, 0)),
                secs(utc(2024, 1, 15, 0, 0)),
            ]
        );

        let months = BucketGen::new(
            BucketType::Month,
            utc(2024, 1, 15, 0, 0),
            utc(2024, 4, 1, 0, 0),
            "UTC",
        )
        .close();
        let starts: Vec<i64> = months.iter().map(|s| s.bucket).collect();
        assert_eq!(
            starts,
            vec![
                secs(utc(2024, 1, 1, 0, 0)),
                secs(utc(2024, 2, 1, 0, 0)),
                secs(utc(2024, 3, 1, 0, 0)),
            ]
        );
    }

    #[test]
    fn test_hour_grid() {
        let mut bg = BucketGen::new(
            BucketType::Hour,
            utc(2024, 5, 5, 10, 30),
            utc(2024, 5, 5, 13, 0),
            "UTC",
        );
        bg.add(utc(2024, 5, 5, 10, 45));
        bg.add(utc(2024, 5, 5, 12, 59));
        let counts: Vec<u64> = bg.close().iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![1, 0, 1]);
    }

    #[test]
    fn test_timezone_day_boundaries() {
        // Budapest is UTC+1 in January
        let mut bg = BucketGen::new(
            BucketType::Day,
            utc(2024, 1, 1, 0, 0),
            utc(2024, 1, 2, 0, 0),
            "Europe/Budapest",
        );
        bg.add(utc(2024, 1, 1, 22, 30));
        bg.add(utc(2024, 1, 1, 23, 30));
        let sums = bg.close();
        assert_eq!(sums.len(), 2);
        assert_eq!(sums[0].bucket, secs(utc(2023, 12, 31, 23, 0)));
        assert_eq!(sums[1].bucket, secs(utc(2024, 1, 1, 23, 0)));
        assert_eq!(sums[0].count, 1);
        assert_eq!(sums[1].count, 1);
    }

    #[test]
    fn test_dst_day_is_short() {
        // clocks jump forward on 2024-03-31 in Budapest
        let sums = BucketGen::new(
            BucketType::Day,
            utc(2024, 3, 30, 23, 0),
            utc(2024, 4, 1, 22, 0),
            "Europe/Budapest",
        )
        .close();
        assert_eq!(sums.len(), 2);
        assert_eq!(sums[1].bucket - sums[0].bucket, 23 * 3600);
    }

    #[test]
    fn test_invalid_timezone_falls_back_to_utc() {
        let begin = utc(2024, 6, 1, 0, 0);
        let end = utc(2024, 6, 4, 0, 0);
        let fallback = BucketGen::new(BucketType::Day, begin, end, "Mars/Olympus_Mons").close();
        let plain = BucketGen::new(BucketType::Day, begin, end, "UTC").close();
        assert_eq!(fallback, plain);
        assert_eq!(resolve_timezone("Mars/Olympus_Mons"), Tz::UTC);
    }

    #[test]
    fn test_empty_window() {
        let t = utc(2024, 6, 1, 0, 0);
        let mut bg = BucketGen::new(BucketType::Day, t, t, "UTC");
        bg.add(t);
        assert!(bg.close().is_empty());
    }
}
