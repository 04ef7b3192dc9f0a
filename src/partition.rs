//! Deterministic routing of business keys and times to storage partitions.
//!
//! A key hashes to one of [`BUCKETS`] buckets, and buckets are spread evenly
//! over the shards. Time selects the epoch: state stores keep a single
//! epoch per shard, log stores open one epoch per month. Routing is a pure
//! function of its inputs.

use crate::error::PartitionError;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Size of the bucket space. Shard counts must divide it.
pub const BUCKETS: u32 = 4000;

/// Stable bucket of a business key in `[0, BUCKETS)`.
pub fn bucket(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes()) % BUCKETS
}

fn to_date(time: i64) -> Result<DateTime<Utc>, PartitionError> {
    Utc.timestamp_millis_opt(time)
        .single()
        .ok_or(PartitionError::InvalidTime(time))
}

/// UTC day of a timestamp as `YYYYMMDD`.
pub fn period(time: i64) -> Result<u32, PartitionError> {
    let date = to_date(time)?;
    let year = u32::try_from(date.year()).map_err(|_| PartitionError::InvalidTime(time))?;
    Ok(year * 10000 + date.month() * 100 + date.day())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Mutable latest state, a single epoch per shard.
    State,
    /// Append only documents, one epoch per month.
    Log,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Partition {
    pub shard: u32,
    pub epoch: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartitionRouter {
    shards: u32,
    kind: StoreKind,
}

impl PartitionRouter {
    pub fn new(shards: u32, kind: StoreKind) -> Result<Self, PartitionError> {
        if shards == 0 || BUCKETS % shards != 0 {
            return Err(PartitionError::InvalidShardCount(shards));
        }
        Ok(Self { shards, kind })
    }

    pub fn shards(&self) -> u32 {
        self.shards
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    fn epoch(&self, period: u32) -> u32 {
        match self.kind {
            StoreKind::State => 0,
            StoreKind::Log => period / 100,
        }
    }

    /// Partitions holding `bucket` during `period`. Reads without a bucket
    /// fan out to every shard; writes require one.
    pub fn forward(
        &self,
        bucket: Option<u32>,
        period: u32,
        operation: Operation,
    ) -> Result<Vec<Partition>, PartitionError> {
        let epoch = self.epoch(period);
        match (bucket, operation) {
            (Some(b), _) => Ok(vec![Partition {
                shard: (b % BUCKETS) / (BUCKETS / self.shards),
                epoch,
            }]),
            (None, Operation::Read) => Ok((0..self.shards)
                .map(|shard| Partition { shard, epoch })
                .collect()),
            (None, Operation::Write) => Err(PartitionError::MissingKey),
        }
    }

    /// Partitions of a business key at a point in time.
    pub fn resolve(
        &self,
        key: Option<&str>,
        time: i64,
        operation: Operation,
    ) -> Result<Vec<Partition>, PartitionError> {
        self.forward(key.map(bucket), period(time)?, operation)
    }

    /// Every partition covering `[from, to]`, in the direction of the
    /// range. Descending when `from > to`.
    pub fn balance(
        &self,
        key: Option<&str>,
        from: i64,
        to: i64,
        operation: Operation,
    ) -> Result<Vec<Partition>, PartitionError> {
        let step = if from <= to {
            Duration::days(1)
        } else {
            -Duration::days(1)
        };
        let last = period(to)?;
        let mut day = to_date(from)?;
        let mut partitions: Vec<Partition> = Vec::new();
        loop {
            let p = period(day.timestamp_millis())?;
            for partition in self.forward(key.map(bucket), p, operation)? {
                if !partitions.contains(&partition) {
                    partitions.push(partition);
                }
            }
            if p == last {
                break;
            }
            day = day
                .checked_add_signed(step)
                .ok_or(PartitionError::InvalidTime(to))?;
        }
        Ok(partitions)
    }
}
