//! Session configuration and result types.

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;

/// Fixed configuration of one tender session. Immutable once the session
/// is booted.
#[derive(Debug, Clone)]
pub struct AuctionConfig {
    /// First round opens.
    pub start_time: DateTime<Utc>,
    /// First round closes, second round opens.
    pub half_time: DateTime<Utc>,
    /// Second round closes.
    pub end_time: DateTime<Utc>,
    /// Units available; equal to the number of winners. 0 disables the
    /// lowest-tenderable-bid tracking.
    pub capacity: u32,
    /// First-round price ceiling; 0 disables.
    pub warning_price: u32,
}

impl AuctionConfig {
    /// Session identifier derived from the start time, used as the log and
    /// shard-table prefix.
    pub fn session_id(&self) -> String {
        self.start_time
            .with_timezone(&local_offset())
            .format("%y%m%d%H%M%S")
            .to_string()
    }
}

/// The tender's wall-clock timezone (Asia/Shanghai, no DST).
pub fn local_offset() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("fixed +08:00 offset")
}

/// Runtime status collected once per second while the session is live.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub time: Option<DateTime<Utc>>,
    pub session: u8,
    pub bidders: u32,
    pub lowest_price: u32,
    pub lowest_time: Option<DateTime<Utc>>,
}

/// Sealed result of a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Final {
    pub capacity: u32,
    pub bidders: u32,
    /// Clearing price: the price of the capacity-th ranked bid.
    pub lowest_price: u32,
    pub lowest_time: Option<DateTime<Utc>>,
    /// Within-second ordinal of the clearing bid among bids at the clearing
    /// price; the public tie-breaker.
    pub lowest_sequence: u32,
    /// Average winning price multiplied by 100.
    pub average_price: u64,
}

/// Truncate to microsecond precision, the resolution of the warehouse
/// timestamp contract.
pub fn truncate_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(t.timestamp_micros()).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_id_uses_local_wall_clock() {
        // 2026-03-01 02:30:00 UTC is 10:30:00 in +08:00.
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 2, 30, 0).unwrap();
        let config = AuctionConfig {
            start_time: start,
            half_time: start,
            end_time: start,
            capacity: 0,
            warning_price: 0,
        };
        assert_eq!(config.session_id(), "260301103000");
    }

    #[test]
    fn truncate_drops_sub_microsecond_precision() {
        let t = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate_micros(t);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(truncate_micros(truncated), truncated);
    }
}
