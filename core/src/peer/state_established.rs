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
use crate::bgp::msg_notification::{BgpError, NotificationMessage};
use crate::lpm::Lpm;
use crate::{debug, info};

impl Peer {
    /// Established: the session is up. UPDATEs maintain the Adj-RIB-In,
    /// keepalives refresh the hold timer.
    pub(super) async fn established(&mut self) -> BgpState {
        self.adj_rib_in = Some(Lpm::new());

        loop {
            tokio::select! {
                Some(op) = self.op_rx.recv() => {
                    let Some(op) = self.handle_common_op(op) else { continue };
                    match op {
                        PeerOp::ManualStop => {
                            self.notify_primary(BgpError::Cease(0)).await;
                            self.timers.stop_connect_retry();
                            self.disconnect();
                            self.connect_retry_counter = 0;
                            return self.change_state(BgpState::Idle, "manual stop event");
                        }
                        PeerOp::AutomaticStop => {
                            self.notify_primary(BgpError::Cease(0)).await;
                            self.timers.stop_connect_retry();
                            self.disconnect();
                            self.connect_retry_counter += 1;
                            return self.change_state(BgpState::Idle, "automatic stop event");
                        }
                        _ => {}
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
                    debug!("closing connection received in Established",
                        "peer" => self.remote.to_string());
                    conn.close();
                }
                Some(recv) = self.msg_rx.recv() => {
                    if let Some(next) = self.established_message(recv).await {
                        return next;
                    }
                }
                Some(fail) = self.msg_fail_rx.recv() => {
                    if !self.collapse_failed_conn(fail.conn_id) {
                        self.disconnect();
                        self.timers.stop_hold_timer();
                        self.timers.stop_keepalive_timer();
                        self.timers.start_connect_retry();
                        self.connect_retry_counter += 1;
                        return self.change_state(
                            BgpState::Idle,
                            format!("TCP failure: {}", fail.error),
                        );
                    }
                }
                Some(err) = self.conn_err_rx.recv() => {
                    debug!("stale outbound connection result in Established",
                        "peer" => self.remote.to_string(),
                        "error" => err.to_string());
                }
                _ = fsm::dying(&mut self.dying) => {
                    return self.change_state(BgpState::Cease, "shutdown requested");
                }
            }
        }
    }

    async fn established_message(&mut self, recv: RecvMsg) -> Option<BgpState> {
        let msg = match recv.msg {
            Err(err) => {
                if let Some(notif) = NotificationMessage::from_parser_error(&err) {
                    self.notify_primary(*notif.error()).await;
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
            BgpMessage::Notification(_) => {
                self.timers.stop_connect_retry();
                self.disconnect();
                self.connect_retry_counter += 1;
                Some(self.change_state(BgpState::Idle, "received NOTIFICATION"))
            }
            BgpMessage::Update(update) => {
                if self.timers.hold_time.as_secs() != 0 {
                    self.timers.reset_hold_timer();
                }

                if let Some(rib) = self.adj_rib_in.as_mut() {
                    for pfx in &update.withdrawn_routes {
                        debug!("removing prefix from Adj-RIB-In",
                            "peer" => self.remote.to_string(),
                            "prefix" => pfx.to_string());
                        rib.remove(pfx);
                    }
                    for pfx in &update.nlri_list {
                        debug!("adding prefix to Adj-RIB-In",
                            "peer" => self.remote.to_string(),
                            "prefix" => pfx.to_string());
                        rib.insert(*pfx);
                    }
                }
                None
            }
            BgpMessage::KeepAlive(_) => {
                if self.timers.hold_time.as_secs() != 0 {
                    self.timers.reset_hold_timer();
                }
                None
            }
            BgpMessage::Open(_) => {
                // A late collision candidate announcing itself; otherwise a
                // protocol violation
                if self.conn_collision.is_some() {
                    if let Some(mut conn) = self.conn_collision.take() {
                        info!("closing leftover collision connection",
                            "peer" => self.remote.to_string(),
                            "conn" => conn.id);
                        Self::dump_collision_conn(&mut conn).await;
                        conn.close();
                    }
                    return None;
                }
                self.notify_primary(BgpError::FiniteStateMachineError).await;
                self.timers.stop_connect_retry();
                self.disconnect();
                self.connect_retry_counter += 1;
                Some(self.change_state(BgpState::Idle, "FSM error"))
            }
        }
    }

    async fn dump_collision_conn(conn: &mut super::Connection) {
        use crate::bgp::msg::Message;
        use crate::bgp::msg_notification::CONNECTION_COLLISION_RESOLUTION;
        let bytes =
            NotificationMessage::new(BgpError::Cease(CONNECTION_COLLISION_RESOLUTION)).serialize();
        let _ = conn.send(&bytes).await;
    }
}
