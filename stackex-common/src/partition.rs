use std::fmt;

use time::OffsetDateTime;

use crate::error::InvalidTimestamp;

/// Hour-granularity calendar bucket, always computed in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
}

impl PartitionKey {
    pub fn from_epoch_seconds(seconds: i64) -> Result<Self, InvalidTimestamp> {
        if seconds < 0 {
            return Err(InvalidTimestamp(seconds));
        }
        let datetime =
            OffsetDateTime::from_unix_timestamp(seconds).map_err(|_| InvalidTimestamp(seconds))?;

        Ok(Self {
            year: datetime.year(),
            month: u8::from(datetime.month()),
            day: datetime.day(),
            hour: datetime.hour(),
        })
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "year={}/month={:02}/day={:02}/hour={:02}",
            self.year, self.month, self.day, self.hour
        )
    }
}

/// Maps a creation timestamp and record id to a hive-style object path.
#[derive(Debug, Clone)]
pub struct Partitioner {
    prefix: String,
}

impl Partitioner {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_owned(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn path(&self, creation_epoch_seconds: i64, record_id: i64) -> Result<String, InvalidTimestamp> {
        let key = PartitionKey::from_epoch_seconds(creation_epoch_seconds)?;
        Ok(format!("{}/{}/part-{:08}.parquet", self.prefix, key, record_id))
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new("parquet")
    }
}
