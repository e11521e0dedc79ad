//! Stable error taxonomy surfaced to `Service::on_error` and to the public
//! API's fallible constructors.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    #[error("allocation failed")]
    OutMemory,
    #[error("connect did not complete")]
    ConnectStatus,
    #[error("timed out")]
    Timeout,
    #[error("connect failed")]
    ConnectFailure,
    #[error("peer shut down the connection")]
    PeerShutdown,
    #[error("read failed")]
    ReadFailure,
    #[error("read produced invalid data")]
    ReadInvalid,
    #[error("read I/O error")]
    ReadIOError,
    #[error("socket is invalid")]
    SocketInvalid,
    #[error("inbound buffer is in an invalid state")]
    InBufferInvalid,
    #[error("write failed")]
    WriteFailure,
    #[error("send queue length limit exceeded")]
    SendQueueLimit,
    #[error("inbound buffer is full")]
    InBufferFull,
    #[error("sid already in use")]
    ConflictSid,
}
