use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub trait TimeSource {
    fn now(&self) -> OffsetDateTime;

    /// Return an RFC 3339 timestamp in UTC
    fn current_time(&self) -> String {
        self.now()
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.now().unix_timestamp().to_string())
    }
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Always returns the same instant, for tests.
#[derive(Clone)]
pub struct FixedTime {
    pub time: OffsetDateTime,
}

impl TimeSource for FixedTime {
    fn now(&self) -> OffsetDateTime {
        self.time
    }
}
