//! Per-session runtime tunables.
//!
//! Grouped separately from [`crate::session::Session`] itself so a caller
//! can build one `Settings` and hand clones to `listen`/`connect`/
//! `associate` without threading a dozen individual setters through the
//! public API, matching the teacher's `TcpConnector::with_*` builder shape
//! generalized to a plain data struct.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Settings {
    /// `None` disables the read-idle timeout entirely.
    pub read_timeout: Option<Duration>,
    /// `None` disables keepalive probing.
    pub keepalive_interval: Option<Duration>,
    /// Max number of not-yet-written frames queued before
    /// `ErrorCode::SendQueueLimit` is raised.
    pub send_queue_limit: usize,
    /// Max bytes the inbound [`crate::buffer::Buffer`] is allowed to hold
    /// before a read yields `ErrorCode::InBufferFull`.
    pub max_inbound_buffer: usize,
    /// Re-deliver unconsumed bytes to `on_process` on the next read even if
    /// no new bytes arrived (used by framing protocols that buffer a
    /// partial message across several `poll` cycles).
    pub persist_read: bool,
    /// Sent once, immediately after the session becomes usable (after a
    /// successful accept/connect/associate/reconnect), ahead of anything
    /// the caller enqueues itself. `None` sends nothing.
    pub on_connect_msg: Option<Vec<u8>>,
    /// Requested `SO_SNDBUF` size in bytes; `None` leaves the OS default.
    /// Best-effort: a failed `setsockopt` is logged, not fatal.
    pub send_buf_size: Option<usize>,
    /// Requested `SO_RCVBUF` size in bytes; same caveats as `send_buf_size`.
    pub recv_buf_size: Option<usize>,
    /// KCP-style transport tuning; ignored by stream sessions.
    pub datagram: DatagramSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_secs(60)),
            keepalive_interval: Some(Duration::from_secs(15)),
            send_queue_limit: 4096,
            max_inbound_buffer: 16 * 1024 * 1024,
            persist_read: false,
            on_connect_msg: None,
            send_buf_size: None,
            recv_buf_size: None,
            datagram: DatagramSettings::default(),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn with_on_connect_msg(mut self, msg: Vec<u8>) -> Self {
        self.on_connect_msg = Some(msg);
        self
    }

    #[must_use]
    pub fn with_socket_buf_size(mut self, send: usize, recv: usize) -> Self {
        self.send_buf_size = Some(send);
        self.recv_buf_size = Some(recv);
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DatagramSettings {
    pub mtu: u32,
    pub min_rto: u32,
    pub send_window: u32,
    pub recv_window: u32,
}

impl Default for DatagramSettings {
    fn default() -> Self {
        Self { mtu: 1400, min_rto: 100, send_window: 128, recv_window: 128 }
    }
}
