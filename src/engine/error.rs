//! Error types for the auction engine.
//!
//! Every rejection carries a stable numeric wire code, grouped by subsystem:
//! - 2-3: session lifecycle
//! - 4-7: request shape and membership
//! - 12-14: first-round admission policy
//! - 21-25: second-round admission policy
//! - 30-35: storage failures, one code per failing step
//!
//! Admission rejections are deterministic and non-retryable; storage errors
//! are logged with the originating bid and surfaced as-is, never retried.

use thiserror::Error;

/// Central error enum for all engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuctionError {
    // =================================================================
    // Lifecycle
    // =================================================================
    /// The session has not opened yet.
    #[error("not ready")]
    NotReady,

    /// The session is over; no further bids are admitted.
    #[error("invalid time")]
    Ended,

    // =================================================================
    // Request shape / membership
    // =================================================================
    /// The request carried engine-assigned fields (time, sequence, active).
    #[error("invalid request")]
    InvalidRequest,

    /// Price below the minimum of 1.
    #[error("invalid price")]
    InvalidPrice,

    /// The bid reached processing outside any admitting round.
    #[error("invalid time")]
    InvalidTime,

    /// The bidder has no recorded bid (enquiry only).
    #[error("not attend")]
    NotAttend,

    // =================================================================
    // First-round policy
    // =================================================================
    /// Price above the first-round warning-price ceiling.
    #[error("greater than warning price")]
    AboveWarningPrice,

    /// The bidder already placed their opening bid.
    #[error("attend first round")]
    AlreadyInFirstRound,

    /// The storage tier accepted the bid after the first round closed.
    #[error("end")]
    FirstRoundClosed,

    // =================================================================
    // Second-round policy
    // =================================================================
    /// Price deviates from the lowest tenderable bid by more than the cap.
    #[error("out of range")]
    OutOfRange,

    /// The bidder did not place an opening bid in the first round.
    #[error("not attend first round")]
    NotInFirstRound,

    /// The bidder exhausted their bid quota.
    #[error("allin")]
    AllIn,

    /// The bidder already bid at this exact price.
    #[error("same price")]
    SamePrice,

    /// The storage tier accepted the bid after the second round closed.
    #[error("end")]
    SecondRoundClosed,

    // =================================================================
    // Storage
    // =================================================================
    /// Opening or borrowing a storage connection failed.
    #[error("storage connection failed")]
    SaveConnection,

    /// The log insert failed.
    #[error("storage insert failed")]
    SaveInsert,

    /// The inserted row id could not be determined.
    #[error("storage row id unavailable")]
    SaveRowId,

    /// Reading the server-assigned timestamp back failed.
    #[error("storage read-back failed")]
    SaveReadBack,

    /// The server-assigned timestamp did not parse.
    #[error("storage timestamp unreadable")]
    SaveTimestamp,

    /// Writing a winning bid to the final table failed.
    #[error("final commit failed")]
    SaveCommit,
}

impl AuctionError {
    /// Stable numeric code carried on the wire.
    pub fn code(&self) -> u16 {
        match self {
            AuctionError::NotReady => 2,
            AuctionError::Ended => 3,
            AuctionError::InvalidRequest => 4,
            AuctionError::InvalidPrice => 5,
            AuctionError::InvalidTime => 6,
            AuctionError::NotAttend => 7,
            AuctionError::AboveWarningPrice => 12,
            AuctionError::AlreadyInFirstRound => 13,
            AuctionError::FirstRoundClosed => 14,
            AuctionError::OutOfRange => 21,
            AuctionError::NotInFirstRound => 22,
            AuctionError::AllIn => 23,
            AuctionError::SamePrice => 24,
            AuctionError::SecondRoundClosed => 25,
            AuctionError::SaveConnection => 30,
            AuctionError::SaveInsert => 31,
            AuctionError::SaveRowId => 32,
            AuctionError::SaveReadBack => 33,
            AuctionError::SaveTimestamp => 34,
            AuctionError::SaveCommit => 35,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuctionError::NotReady.code(), 2);
        assert_eq!(AuctionError::Ended.code(), 3);
        assert_eq!(AuctionError::InvalidRequest.code(), 4);
        assert_eq!(AuctionError::NotAttend.code(), 7);
        assert_eq!(AuctionError::AboveWarningPrice.code(), 12);
        assert_eq!(AuctionError::AlreadyInFirstRound.code(), 13);
        assert_eq!(AuctionError::FirstRoundClosed.code(), 14);
        assert_eq!(AuctionError::OutOfRange.code(), 21);
        assert_eq!(AuctionError::NotInFirstRound.code(), 22);
        assert_eq!(AuctionError::AllIn.code(), 23);
        assert_eq!(AuctionError::SamePrice.code(), 24);
        assert_eq!(AuctionError::SecondRoundClosed.code(), 25);
        assert_eq!(AuctionError::SaveCommit.code(), 35);
    }

    #[test]
    fn storage_codes_are_contiguous() {
        let storage = [
            AuctionError::SaveConnection,
            AuctionError::SaveInsert,
            AuctionError::SaveRowId,
            AuctionError::SaveReadBack,
            AuctionError::SaveTimestamp,
            AuctionError::SaveCommit,
        ];
        for (i, err) in storage.iter().enumerate() {
            assert_eq!(err.code(), 30 + i as u16);
        }
    }
}
