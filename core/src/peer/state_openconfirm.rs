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
use super::{BgpState, Peer, PeerOp, RecvMsg};
use crate::bgp::msg::BgpMessage;
use crate::bgp::msg_notification::{BgpError, NotificationMessage, OpenMessageError};
use crate::debug;

impl Peer {
    /// OpenConfirm: OPENs have crossed; waiting for the neighbor's
    /// KEEPALIVE to confirm the session.
    pub(super) async fn open_confirm(&mut self) -> BgpState {
        loop {
            tokio::select! {
                Some(op) = self.op_rx.recv() => {
                    let Some(op) = self.handle_common_op(op) else { continue };
                    if let PeerOp::ManualStop = op {
                        self.notify_all(BgpError::Cease(0)).await;
                        self.timers.stop_connect_retry();
                        self.disconnect();
                        self.connect_retry_counter = 0;
                        return self.change_state(BgpState::Idle, "manual stop event");
                    }
                }
                _ = fsm::deadline(self.timers.hold_deadline()) => {
                    self.notify_primary(BgpError::HoldTimerExpired).await;
                    self.timers.stop_connect_retry();
                    self.timers.stop_hold_timer();
                    self.disconnect();
                    self.connect_retry_counter += 1;
                    return self.change_state(BgpState::Idle, "hold timer expired");
                }
                _ = fsm::deadline(self.timers.keepalive_deadline()) => {
                    if let Err(err) = self.send_keepalive().await {
                        self.timers.stop_connect_retry();
                        self.disconnect();
                        self.connect_retry_counter += 1;
                        return self.change_state(
                            BgpState::Idle,
                            format!("failed to send keepalive: {}", err),
                        );
                    }
                    self.timers.reset_keepalive_timer();
                }
                Some(conn) = self.conn_rx.recv() => {
                    self.track_collision(conn).await;
                }
                Some(recv) = self.msg_rx.recv() => {
                    if let Some(next) = self.open_confirm_message(recv).await {
                        return next;
                    }
                }
                Some(fail) = self.msg_fail_rx.recv() => {
                    if !self.collapse_failed_conn(fail.conn_id) {
                        return self.open_confirm_tcp_fail(&fail.error);
                    }
                }
                Some(err) = self.conn_err_rx.recv() => {
                    debug!("stale outbound connection result in OpenConfirm",
                        "peer" => self.remote.to_string(),
                        "error" => err.to_string());
                }
                _ = fsm::dying(&mut self.dying) => {
                    return self.change_state(BgpState::Cease, "shutdown requested");
                }
            }
        }
    }

    async fn open_confirm_message(&mut self, recv: RecvMsg) -> Option<BgpState> {
        let msg = match recv.msg {
            Err(err) => {
                if let Some(notif) = NotificationMessage::from_parser_error(&err) {
                    self.notify_all(*notif.error()).await;
                }
                self.timers.stop_connect_retry();
                self.disconnect();
                self.connect_retry_counter += 1;
                return Some(self.change_state(
                    BgpState::Idle,
                    format!("failed to decode BGP message: {}", err),
                ));
            }
            Ok(msg) => msg,
        };

        match msg {
            BgpMessage::Notification(notif) => {
                if *notif.error()
                    == BgpError::OpenMessageError(OpenMessageError::UnsupportedVersionNumber)
                {
                    self.timers.stop_connect_retry();
                    self.disconnect();
                    return Some(self.change_state(BgpState::Idle, "received NOTIFICATION"));
                }

                if let BgpError::Cease(_) = notif.error() {
                    if self.connection_doomed(recv.conn_id) {
                        self.close_connection(recv.conn_id);
                        return None;
                    }
                }

                Some(self.open_confirm_tcp_fail("NOTIFICATION received"))
            }
            BgpMessage::KeepAlive(_) => {
                self.timers.reset_hold_timer();
                Some(self.change_state(BgpState::Established, "received KEEPALIVE"))
            }
            BgpMessage::Open(open) => {
                // The collision candidate's OPEN: learn the router-id and
                // settle which connection survives
                self.neighbor_id = open.bgp_identifier;
                self.resolve_collision().await;
                None
            }
            BgpMessage::Update(_) => {
                self.notify_primary(BgpError::FiniteStateMachineError).await;
                self.timers.stop_connect_retry();
                self.disconnect();
                self.connect_retry_counter += 1;
                Some(self.change_state(BgpState::Idle, "FSM error"))
            }
        }
    }

    fn open_confirm_tcp_fail(&mut self, err: &str) -> BgpState {
        self.disconnect();
        self.timers.stop_hold_timer();
        self.timers.stop_keepalive_timer();
        self.timers.start_connect_retry();
        self.connect_retry_counter += 1;
        self.change_state(BgpState::Idle, format!("failure: {}", err))
    }
}
