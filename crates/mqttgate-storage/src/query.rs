//! Read-side aggregation over stored documents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::documents::{DocumentStore, StoredDocument};
use crate::{Error, Result};

/// A timestamped field mapping returned by queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl From<StoredDocument> for DataPoint {
    fn from(doc: StoredDocument) -> Self {
        Self {
            timestamp: doc.timestamp,
            data: doc.data,
        }
    }
}

/// Running per-field sums of numeric values.
#[derive(Debug, Clone, Default)]
struct PeriodSum {
    sums: Map<String, Value>,
}

impl PeriodSum {
    fn add(&mut self, data: &Map<String, Value>) {
        for (key, value) in data {
            let Some(n) = value.as_f64() else {
                continue;
            };
            let total = self.sums.get(key).and_then(Value::as_f64).unwrap_or(0.0) + n;
            self.sums.insert(key.clone(), number(total));
        }
    }

    fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

/// Whole numbers stay integers in the output.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn check_period(period_minutes: i64) -> Result<Duration> {
    if period_minutes <= 0 {
        return Err(Error::InvalidInput(
            "period must be a positive integer".to_string(),
        ));
    }
    Duration::try_minutes(period_minutes)
        .ok_or_else(|| Error::InvalidInput(format!("period of {} minutes is too large", period_minutes)))
}

fn period_overflow() -> Error {
    Error::InvalidInput("period does not fit the time range".to_string())
}

/// Round `ts` down to a multiple of `period` since the epoch.
fn floor_to(ts: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let step = period.num_seconds();
    let secs = ts.timestamp().div_euclid(step) * step;
    DateTime::from_timestamp(secs, 0).unwrap_or(ts)
}

impl DocumentStore {
    /// Documents in `[start, end)` as data points.
    pub fn query_range(
        &self,
        database: &str,
        collection: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>> {
        Ok(self
            .range(database, collection, start, end)?
            .into_iter()
            .map(DataPoint::from)
            .collect())
    }

    /// Documents in `[start, end)` summed per `period_minutes` bucket.
    ///
    /// Buckets are aligned to period boundaries and run from `start` rounded
    /// down to `end` rounded down plus one period. Buckets without numeric
    /// values are omitted.
    pub fn query_range_summed(
        &self,
        database: &str,
        collection: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period_minutes: i64,
    ) -> Result<Vec<DataPoint>> {
        let period = check_period(period_minutes)?;
        let docs = self.range(database, collection, start, end)?;

        let mut out = Vec::new();
        let mut bucket_start = floor_to(start, period);
        let last = floor_to(end, period)
            .checked_add_signed(period)
            .ok_or_else(period_overflow)?;
        let mut docs = docs.iter().peekable();

        while bucket_start < last {
            let bucket_end = bucket_start
                .checked_add_signed(period)
                .ok_or_else(period_overflow)?;
            let mut sum = PeriodSum::default();
            while let Some(doc) = docs.next_if(|d| d.timestamp < bucket_end) {
                sum.add(&doc.data);
            }
            if !sum.is_empty() {
                out.push(DataPoint {
                    timestamp: bucket_start,
                    data: sum.sums,
                });
            }
            bucket_start = bucket_end;
        }
        Ok(out)
    }

    /// Sum of the last complete period before the latest document.
    ///
    /// The latest timestamp is rounded down to a period boundary `end`; the
    /// result covers `[end - period, end)` and is stamped `end`.
    pub fn query_last_period_sum(
        &self,
        database: &str,
        collection: &str,
        period_minutes: i64,
    ) -> Result<DataPoint> {
        let period = check_period(period_minutes)?;
        let latest = self
            .last(database, collection)?
            .ok_or_else(|| Error::NotFound(format!("no data in '{}/{}'", database, collection)))?;

        let end = floor_to(latest.timestamp, period);
        let start = end.checked_sub_signed(period).ok_or_else(period_overflow)?;

        let mut sum = PeriodSum::default();
        for doc in self.range(database, collection, start, end)? {
            sum.add(&doc.data);
        }
        Ok(DataPoint {
            timestamp: end,
            data: sum.sums,
        })
    }

    /// Latest document as a data point.
    pub fn query_last(&self, database: &str, collection: &str) -> Result<DataPoint> {
        self.last(database, collection)?
            .map(DataPoint::from)
            .ok_or_else(|| Error::NotFound(format!("no data in '{}/{}'", database, collection)))
    }
}
