//! Typed engine errors.
//!
//! Framing errors never reach a caller — they're logged and the offending
//! frame is dropped, since `'$'` lines arrive unsolicited. Everything else
//! here is either handed back through a [`PendingCommand`](crate::scheduler::PendingCommand)
//! completion slot or raised synchronously at enqueue time.

use std::time::Duration;

use crate::types::ModuleAddress;

/// Why a candidate `$` frame was rejected by the codec validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameRejectReason {
    #[error("LL field is not valid hex")]
    NonHexLength,
    #[error("frame length does not match LL field")]
    LengthMismatch,
    #[error("CRC8 mismatch")]
    Crc8Mismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum NikobusError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("transport lost mid-session")]
    TransportLost,

    #[error("frame rejected: {0}")]
    FrameRejected(#[from] FrameRejectReason),

    #[error("no ACK received within {0:?}")]
    AckTimeout(Duration),

    #[error("no matching answer received within {0:?}")]
    AnswerTimeout(Duration),

    #[error("command exhausted its retries")]
    RetriesExhausted,

    #[error("unknown module address {0}")]
    UnknownModule(ModuleAddress),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("command queue is closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, NikobusError>;
