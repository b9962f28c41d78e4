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

use super::fsm;
use super::{BgpState, Peer, PeerOp, INITIAL_HOLD_TIME};
use crate::debug;

impl Peer {
    /// Active: waiting for the neighbor to connect to us. The connect-retry
    /// timer falls back to dialing out.
    pub(super) async fn active(&mut self) -> BgpState {
        loop {
            tokio::select! {
                Some(op) = self.op_rx.recv() => {
                    let Some(op) = self.handle_common_op(op) else { continue };
                    if let PeerOp::ManualStop = op {
                        self.disconnect();
                        self.connect_retry_counter = 0;
                        self.timers.stop_connect_retry();
                        return self.change_state(BgpState::Idle, "manual stop event");
                    }
                }
                _ = fsm::deadline(self.timers.connect_retry_deadline()) => {
                    self.timers.start_connect_retry();
                    self.initiate_connect();
                    return self.change_state(BgpState::Connect, "connect retry timer expired");
                }
                Some(conn) = self.conn_rx.recv() => {
                    debug!("TCP connection established",
                        "peer" => self.remote.to_string(),
                        "local_addr" => conn.local_addr.to_string(),
                        "remote_addr" => conn.peer_addr.to_string());
                    self.conn = Some(conn);
                    self.timers.stop_connect_retry();
                    return self.active_send_open().await;
                }
                Some(err) = self.conn_err_rx.recv() => {
                    debug!("stale outbound connection result in Active",
                        "peer" => self.remote.to_string(),
                        "error" => err.to_string());
                }
                _ = fsm::dying(&mut self.dying) => {
                    return self.change_state(BgpState::Cease, "shutdown requested");
                }
            }
        }
    }

    async fn active_send_open(&mut self) -> BgpState {
        if let Err(err) = self.send_open().await {
            self.timers.start_connect_retry();
            self.connect_retry_counter += 1;
            self.disconnect();
            return self.change_state(
                BgpState::Idle,
                format!("sending OPEN message failed: {}", err),
            );
        }
        self.timers.set_initial_hold_time(INITIAL_HOLD_TIME);
        self.timers.start_hold_timer();
        self.change_state(BgpState::OpenSent, "sent OPEN message")
    }
}
