//! Core data types shared by both tiers
//!
//! # Key Types
//!
//! - **`BusinessZone`**: the fixed UTC offset that defines bucket and day edges
//! - **`TimeBucket`**: an hour-aligned bucket, labelled `YYYYMMDDHH`
//! - **`BucketRange`**: half-open range of buckets used by every range query
//! - **`TimeWindow`**: caller-supplied `[from, to]`, normalized into a `BucketRange`
//! - **`TrafficSummary`**: upload/download pair with saturating arithmetic
//! - **`GroupDimension`** / **`GroupKey`**: how aggregates are grouped
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use traffic_ledger::types::{BusinessZone, TimeWindow, WindowAlign};
//!
//! let zone = BusinessZone::default(); // +08:00
//! let from = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
//! let to = Utc.with_ymd_and_hms(2024, 3, 1, 5, 30, 0).unwrap();
//! let range = TimeWindow::new(from, to).unwrap().normalize(&zone, WindowAlign::Hour).unwrap();
//! assert_eq!(range.len(), 6);
//! assert_eq!(range.start().label(), "2024030108");
//! ```

use crate::error::{LedgerError, Result};
use crate::key::ResourceType;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const SECS_PER_HOUR: i64 = 3_600;
const SECS_PER_DAY: i64 = 86_400;

/// Default business zone offset (+08:00)
pub const DEFAULT_OFFSET_MINUTES: i32 = 8 * 60;

/// Fixed business timezone used to cut buckets, days and months
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessZone {
    offset: FixedOffset,
}

impl Default for BusinessZone {
    fn default() -> Self {
        let offset = FixedOffset::east_opt(DEFAULT_OFFSET_MINUTES * 60).unwrap_or(Utc.fix());
        Self { offset }
    }
}

impl BusinessZone {
    /// Build a zone from an offset east of UTC, in minutes
    pub fn from_offset_minutes(minutes: i32) -> Result<Self> {
        FixedOffset::east_opt(minutes * 60)
            .map(|offset| Self { offset })
            .ok_or_else(|| {
                LedgerError::Configuration(format!("UTC offset out of range: {} minutes", minutes))
            })
    }

    /// Underlying offset
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Bucket containing `instant`
    pub fn bucket_of(&self, instant: DateTime<Utc>) -> TimeBucket {
        TimeBucket {
            start: truncate_secs(instant.with_timezone(&self.offset), SECS_PER_HOUR),
        }
    }

    /// Parse a `YYYYMMDDHH` bucket label in this zone
    pub fn parse_bucket(&self, label: &str) -> Result<TimeBucket> {
        if label.len() != 10 || !label.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LedgerError::Validation(format!(
                "bucket label must be 10 digits (YYYYMMDDHH), got {:?}",
                label
            )));
        }
        let naive = NaiveDateTime::parse_from_str(&format!("{}00", label), "%Y%m%d%H%M")
            .map_err(|e| LedgerError::Validation(format!("bad bucket label {:?}: {}", label, e)))?;
        Ok(TimeBucket {
            start: self.local(naive),
        })
    }

    /// Start of the business day containing `instant`
    pub fn day_start(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        truncate_secs(instant.with_timezone(&self.offset), SECS_PER_DAY)
    }

    fn local(&self, naive: NaiveDateTime) -> DateTime<FixedOffset> {
        let utc = naive - Duration::seconds(self.offset.local_minus_utc() as i64);
        DateTime::from_naive_utc_and_offset(utc, self.offset)
    }
}

/// Truncate a local timestamp down to a multiple of `unit` seconds in local time
fn truncate_secs(dt: DateTime<FixedOffset>, unit: i64) -> DateTime<FixedOffset> {
    let local_secs = dt.timestamp() + dt.offset().local_minus_utc() as i64;
    dt - Duration::seconds(local_secs.rem_euclid(unit))
        - Duration::nanoseconds(dt.timestamp_subsec_nanos() as i64)
}

/// An hour-aligned time bucket in the business zone
///
/// Ordering and equality follow the bucket's start instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeBucket {
    start: DateTime<FixedOffset>,
}

impl TimeBucket {
    /// Start instant in the business zone
    pub fn start(&self) -> DateTime<FixedOffset> {
        self.start
    }

    /// Start instant in UTC
    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start.with_timezone(&Utc)
    }

    /// Exclusive end instant in UTC
    pub fn end_utc(&self) -> DateTime<Utc> {
        self.next().start_utc()
    }

    /// Sortable `YYYYMMDDHH` label
    pub fn label(&self) -> String {
        self.start.format("%Y%m%d%H").to_string()
    }

    /// Following bucket
    pub fn next(&self) -> TimeBucket {
        TimeBucket {
            start: self.start + Duration::hours(1),
        }
    }

    /// Preceding bucket
    pub fn prev(&self) -> TimeBucket {
        TimeBucket {
            start: self.start - Duration::hours(1),
        }
    }

    /// Start of the period of the given granularity containing this bucket
    pub fn period_start(&self, granularity: Granularity) -> DateTime<FixedOffset> {
        granularity.truncate(self.start)
    }

    /// Numeric score used to order buckets in sorted sets (hours since epoch)
    pub fn score(&self) -> i64 {
        self.start.timestamp().div_euclid(SECS_PER_HOUR)
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Trend granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One point per bucket
    Hour,
    /// One point per business day
    Day,
    /// One point per calendar month in the business zone
    Month,
}

impl Granularity {
    /// Truncate a local timestamp to the start of its period
    pub fn truncate(&self, dt: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        match self {
            Granularity::Hour => truncate_secs(dt, SECS_PER_HOUR),
            Granularity::Day => truncate_secs(dt, SECS_PER_DAY),
            Granularity::Month => {
                let day = truncate_secs(dt, SECS_PER_DAY);
                day - Duration::days(day.day0() as i64)
            },
        }
    }
}

/// Half-open range of buckets `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRange {
    start: TimeBucket,
    end: TimeBucket,
}

impl BucketRange {
    /// Create a range, rejecting empty ones
    pub fn new(start: TimeBucket, end: TimeBucket) -> Result<Self> {
        if start >= end {
            return Err(LedgerError::Validation(format!(
                "empty window: {} .. {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// First bucket
    pub fn start(&self) -> TimeBucket {
        self.start
    }

    /// Exclusive end bucket
    pub fn end(&self) -> TimeBucket {
        self.end
    }

    /// Number of buckets
    pub fn len(&self) -> usize {
        (self.end.score() - self.start.score()).max(0) as usize
    }

    /// Always false for a constructed range
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `bucket` lies in the range
    pub fn contains(&self, bucket: TimeBucket) -> bool {
        bucket >= self.start && bucket < self.end
    }

    /// Iterate the buckets in order
    pub fn buckets(&self) -> impl Iterator<Item = TimeBucket> {
        let end = self.end;
        std::iter::successors(Some(self.start), move |b| {
            let next = b.next();
            (next < end).then_some(next)
        })
    }

    /// Split at `boundary` into `(before, from_boundary)`
    ///
    /// The two halves never overlap and together cover the range. Either side is
    /// `None` when empty.
    pub fn split_at(&self, boundary: TimeBucket) -> (Option<BucketRange>, Option<BucketRange>) {
        let before = BucketRange::new(self.start, boundary.min(self.end)).ok();
        let after = BucketRange::new(boundary.max(self.start), self.end).ok();
        (before, after)
    }

    /// UTC instants `[start, end)`
    pub fn utc_bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start.start_utc(), self.end.start_utc())
    }
}

/// How a window's inclusive end is widened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAlign {
    /// Widen `to` to the end of its bucket
    Hour,
    /// Widen `from` to the start and `to` to the end of their business days
    Day,
}

/// Caller-supplied inclusive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window, rejecting inverted ranges
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from > to {
            return Err(LedgerError::Validation(format!(
                "inverted range: from {} is after to {}",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    /// Window start
    pub fn from(&self) -> DateTime<Utc> {
        self.from
    }

    /// Inclusive window end
    pub fn to(&self) -> DateTime<Utc> {
        self.to
    }

    /// Normalize into a half-open bucket range
    pub fn normalize(&self, zone: &BusinessZone, align: WindowAlign) -> Result<BucketRange> {
        let start = zone.bucket_of(self.from);
        let last = zone.bucket_of(self.to);
        match align {
            WindowAlign::Hour => BucketRange::new(start, last.next()),
            WindowAlign::Day => {
                let day_start = zone.day_start(self.from).with_timezone(&Utc);
                let day_end = zone.day_start(self.to).with_timezone(&Utc) + Duration::days(1);
                BucketRange::new(zone.bucket_of(day_start), zone.bucket_of(day_end))
            },
        }
    }
}

/// Upload/download byte pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficSummary {
    /// Uploaded bytes
    pub upload: u64,
    /// Downloaded bytes
    pub download: u64,
}

impl TrafficSummary {
    /// Create a summary
    pub fn new(upload: u64, download: u64) -> Self {
        Self { upload, download }
    }

    /// Upload plus download
    pub fn total(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }

    /// Both components zero
    pub fn is_zero(&self) -> bool {
        self.upload == 0 && self.download == 0
    }

    /// Add another summary in place
    pub fn add(&mut self, other: TrafficSummary) {
        self.upload = self.upload.saturating_add(other.upload);
        self.download = self.download.saturating_add(other.download);
    }
}

/// Dimension used to group aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupDimension {
    /// One group per subscription
    Subscription,
    /// One group per `(resource_type, resource_id)`
    Resource,
    /// A single platform-wide group
    PlatformTotal,
}

/// Grouping key produced for a dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupKey {
    /// Platform-wide total
    Total,
    /// A subscription
    Subscription(u64),
    /// A resource
    Resource {
        /// Resource type tag
        resource_type: ResourceType,
        /// Resource identifier
        resource_id: u64,
    },
}

impl GroupKey {
    /// Group key of a record under `dimension`
    pub fn for_record(
        dimension: GroupDimension,
        subscription_id: u64,
        resource_type: &ResourceType,
        resource_id: u64,
    ) -> GroupKey {
        match dimension {
            GroupDimension::Subscription => GroupKey::Subscription(subscription_id),
            GroupDimension::Resource => GroupKey::Resource {
                resource_type: resource_type.clone(),
                resource_id,
            },
            GroupDimension::PlatformTotal => GroupKey::Total,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Total => write!(f, "total"),
            GroupKey::Subscription(id) => write!(f, "subscription:{}", id),
            GroupKey::Resource {
                resource_type,
                resource_id,
            } => write!(f, "{}:{}", resource_type, resource_id),
        }
    }
}

/// One point of a trend series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendPoint {
    /// Period start in the business zone
    pub period: DateTime<FixedOffset>,
    /// Traffic in the period
    pub traffic: TrafficSummary,
}

/// A result that may have been cut at a row cap
///
/// `total_rows` is the true number of source rows, so callers can warn rather
/// than silently lose data when `truncated` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct Capped<T> {
    /// Possibly truncated result
    pub value: T,
    /// Rows that matched before the cap applied
    pub total_rows: usize,
    /// Whether the cap cut the result
    pub truncated: bool,
}

impl<T> Capped<T> {
    /// A result that was not truncated
    pub fn complete(value: T, total_rows: usize) -> Self {
        Self {
            value,
            total_rows,
            truncated: false,
        }
    }
}

/// One write in a batch increment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// Owning subscription
    pub subscription_id: u64,
    /// Resource type tag, validated on write
    pub resource_type: String,
    /// Resource identifier
    pub resource_id: u64,
    /// Uploaded bytes
    pub upload: u64,
    /// Downloaded bytes
    pub download: u64,
}

/// 1-based pagination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// 1-based page number
    pub number: usize,
    /// Items per page
    pub size: usize,
}

impl Page {
    /// Create a page request
    pub fn new(number: usize, size: usize) -> Result<Self> {
        if number == 0 || size == 0 {
            return Err(LedgerError::Validation(format!(
                "page and page size must be positive (page={}, size={})",
                number, size
            )));
        }
        Ok(Self { number, size })
    }

    /// Number of items to skip
    pub fn offset(&self) -> usize {
        (self.number - 1).saturating_mul(self.size)
    }
}
