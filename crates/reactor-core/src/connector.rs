//! Outbound-connection bookkeeping, including reconnect backoff.
//!
//! Generalizes the `ConnectionVariant::Outbound` + `maybe_reconnect` pair
//! from the teacher's `ConnectionManager`: a failed or dropped outbound
//! session is re-dialed on a fixed interval rather than dropped for good,
//! using [`crate::timer::TimerWheel`] for the backoff instead of the
//! teacher's poll-loop-rate repeat-interval check, since a reactor here may
//! go a long time between `poll` wakeups when idle.

use std::net::SocketAddr;
use std::time::Duration;

use crate::settings::Settings;
use crate::timer::TimerId;

pub struct Connector {
    pub addr: SocketAddr,
    pub settings: Settings,
    pub reconnect_interval: Duration,
    pub backoff_timer: Option<TimerId>,
}

impl Connector {
    pub fn new(addr: SocketAddr, settings: Settings, reconnect_interval: Duration) -> Self {
        Self { addr, settings, reconnect_interval, backoff_timer: None }
    }
}
