// Copyright 2025 bgpcore Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FSM states and timers.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// BGP FSM states (RFC 4271 Section 8.2.2). Cease is terminal: the peer
/// task exits when it is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgpState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
    Cease,
}

impl BgpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BgpState::Idle => "Idle",
            BgpState::Connect => "Connect",
            BgpState::Active => "Active",
            BgpState::OpenSent => "OpenSent",
            BgpState::OpenConfirm => "OpenConfirm",
            BgpState::Established => "Established",
            BgpState::Cease => "Cease",
        }
    }
}

impl std::fmt::Display for BgpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot FSM timers. A timer is armed by setting its deadline and fires
/// at most once; every reset is explicit.
#[derive(Debug, Clone)]
pub struct FsmTimers {
    /// ConnectRetry timer value
    pub connect_retry_time: Duration,

    /// Hold timer value, negotiated with the peer after the OPEN exchange
    pub hold_time: Duration,

    /// Keepalive timer value, one third of the negotiated hold time
    pub keepalive_time: Duration,

    connect_retry_deadline: Option<Instant>,
    hold_deadline: Option<Instant>,
    keepalive_deadline: Option<Instant>,
}

impl FsmTimers {
    pub fn new(connect_retry_time: Duration, hold_time: Duration, keepalive_time: Duration) -> Self {
        FsmTimers {
            connect_retry_time,
            hold_time,
            keepalive_time,
            connect_retry_deadline: None,
            hold_deadline: None,
            keepalive_deadline: None,
        }
    }

    pub fn start_connect_retry(&mut self) {
        self.connect_retry_deadline = Some(Instant::now() + self.connect_retry_time);
    }

    pub fn stop_connect_retry(&mut self) {
        self.connect_retry_deadline = None;
    }

    pub fn connect_retry_deadline(&self) -> Option<Instant> {
        self.connect_retry_deadline
    }

    pub fn start_hold_timer(&mut self) {
        self.hold_deadline = Some(Instant::now() + self.hold_time);
    }

    pub fn reset_hold_timer(&mut self) {
        self.start_hold_timer();
    }

    pub fn stop_hold_timer(&mut self) {
        self.hold_deadline = None;
    }

    pub fn hold_deadline(&self) -> Option<Instant> {
        self.hold_deadline
    }

    pub fn start_keepalive_timer(&mut self) {
        self.keepalive_deadline = Some(Instant::now() + self.keepalive_time);
    }

    pub fn reset_keepalive_timer(&mut self) {
        self.start_keepalive_timer();
    }

    pub fn stop_keepalive_timer(&mut self) {
        self.keepalive_deadline = None;
    }

    pub fn keepalive_deadline(&self) -> Option<Instant> {
        self.keepalive_deadline
    }

    /// Applies the hold time negotiated from the OPEN exchange. The
    /// keepalive interval is a third of it.
    pub fn set_negotiated_hold_time(&mut self, hold_time: u16) {
        self.hold_time = Duration::from_secs(hold_time as u64);
        self.keepalive_time = Duration::from_secs(hold_time as u64 / 3);
    }

    /// Sets the interim hold time used between sending an OPEN and
    /// completing negotiation.
    pub fn set_initial_hold_time(&mut self, hold_time: Duration) {
        self.hold_time = hold_time;
    }
}

/// Sleeps until `deadline`; never completes when the timer is not armed.
pub(crate) async fn deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Completes when the dying flag flips (or its sender is gone).
pub(crate) async fn dying(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
