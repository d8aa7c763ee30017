//! Error taxonomy of the AM entity.
//!
//! Only [AmError::MaxRetransmissionsExceeded] is fatal. Everything else is recovered locally:
//!  codec and window errors are logged and counted by the entity, `WindowStall` and
//!  `NothingToSend` just mean 'try again later'.

use crate::sn::Sn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmError {
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("transmit window stalled")]
    WindowStall,

    #[error("nothing to send")]
    NothingToSend,

    #[error("SN {sn} is a duplicate or outside the receive window (duplicate: {duplicate})")]
    DuplicateOrOutOfWindow { sn: Sn, duplicate: bool },

    #[error("maximum number of retransmissions exceeded for SN {sn}")]
    MaxRetransmissionsExceeded { sn: Sn },

    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    #[error("entity halted after a fatal error, waiting for re-establishment")]
    Halted,

    #[error("unit rejected: {0}")]
    UnitRejected(String),
}

impl AmError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AmError::MaxRetransmissionsExceeded { .. })
    }

    /// true for conditions that resolve by themselves, i.e. the caller should simply retry later
    pub fn is_retryable(&self) -> bool {
        matches!(self, AmError::WindowStall | AmError::NothingToSend)
    }
}
