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
    /// OpenSent: our OPEN is on the wire, waiting for the neighbor's. A
    /// second connection arriving here starts collision tracking.
    pub(super) async fn open_sent(&mut self) -> BgpState {
        self.start_primary_reader();

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
                Some(conn) = self.conn_rx.recv() => {
                    // Second connection coming in: collision
                    self.track_collision(conn).await;
                }
                Some(recv) = self.msg_rx.recv() => {
                    if let Some(next) = self.open_sent_message(recv).await {
                        return next;
                    }
                }
                Some(fail) = self.msg_fail_rx.recv() => {
                    if !self.collapse_failed_conn(fail.conn_id) {
                        return self.open_sent_tcp_fail(&fail.error);
                    }
                }
                Some(err) = self.conn_err_rx.recv() => {
                    debug!("stale outbound connection result in OpenSent",
                        "peer" => self.remote.to_string(),
                        "error" => err.to_string());
                }
                _ = fsm::dying(&mut self.dying) => {
                    return self.change_state(BgpState::Cease, "shutdown requested");
                }
            }
        }
    }

    async fn open_sent_message(&mut self, recv: RecvMsg) -> Option<BgpState> {
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
                    // The neighbor is shedding the connection that collision
                    // resolution would discard anyway; state does not regress
                    if self.connection_doomed(recv.conn_id) {
                        self.close_connection(recv.conn_id);
                        return None;
                    }
                }

                self.timers.stop_connect_retry();
                self.disconnect();
                self.connect_retry_counter += 1;
                Some(self.change_state(BgpState::Idle, "received NOTIFICATION"))
            }
            BgpMessage::Open(open) => {
                self.neighbor_id = open.bgp_identifier;
                self.resolve_collision().await;
                self.timers.stop_connect_retry();

                if let Err(err) = self.send_keepalive().await {
                    return Some(self.open_sent_tcp_fail(&err.to_string()));
                }

                let hold = (self.hold_time_configured.as_secs() as u16).min(open.hold_time);
                self.timers.set_negotiated_hold_time(hold);
                if hold != 0 {
                    self.timers.reset_hold_timer();
                    self.timers.reset_keepalive_timer();
                } else {
                    self.timers.stop_hold_timer();
                    self.timers.stop_keepalive_timer();
                }
                Some(self.change_state(BgpState::OpenConfirm, "received OPEN message"))
            }
            _ => {
                self.notify_primary(BgpError::FiniteStateMachineError).await;
                self.timers.stop_connect_retry();
                self.disconnect();
                self.connect_retry_counter += 1;
                Some(self.change_state(BgpState::Idle, "FSM error"))
            }
        }
    }

    fn open_sent_tcp_fail(&mut self, err: &str) -> BgpState {
        self.disconnect();
        self.timers.stop_hold_timer();
        self.timers.start_connect_retry();
        self.change_state(BgpState::Active, format!("TCP failure: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use super::super::ConnectionDirection;
    use super::*;
    use crate::bgp::msg::Message;
    use crate::bgp::msg_open::OpenMessage;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_sent_receives_open() {
        let mut t =
            create_test_peer_with_state(BgpState::OpenSent, ConnectionDirection::Incoming).await;
        t.peer.timers.start_hold_timer();

        // Neighbor's OPEN: ASN 65001, hold 30, router-id 2.2.2.2
        let open = OpenMessage::new(65001, 30, 0x02020202).serialize();
        t.remote_stream.write_all(&open).await.unwrap();

        let next = t.peer.open_sent().await;
        assert_eq!(next, BgpState::OpenConfirm);
        assert_eq!(t.peer.neighbor_id, 0x02020202);
        // Negotiated hold is the minimum of ours (90) and theirs (30)
        assert_eq!(t.peer.timers.hold_time, Duration::from_secs(30));
        assert_eq!(t.peer.timers.keepalive_time, Duration::from_secs(10));
        assert!(t.peer.timers.hold_deadline().is_some());
        assert!(t.peer.timers.keepalive_deadline().is_some());

        // And our KEEPALIVE went out
        let mut buf = [0u8; 19];
        t.remote_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[18], 4);
    }

    #[tokio::test]
    async fn test_open_sent_zero_hold_time_disables_timers() {
        let mut t =
            create_test_peer_with_state(BgpState::OpenSent, ConnectionDirection::Incoming).await;
        t.peer.timers.start_hold_timer();

        let open = OpenMessage::new(65001, 0, 0x02020202).serialize();
        t.remote_stream.write_all(&open).await.unwrap();

        let next = t.peer.open_sent().await;
        assert_eq!(next, BgpState::OpenConfirm);
        assert!(t.peer.timers.hold_deadline().is_none());
        assert!(t.peer.timers.keepalive_deadline().is_none());
    }

    #[tokio::test]
    async fn test_open_sent_hold_timer_expires() {
        let mut t =
            create_test_peer_with_state(BgpState::OpenSent, ConnectionDirection::Incoming).await;
        t.peer.timers.hold_time = Duration::from_millis(10);
        t.peer.timers.start_hold_timer();

        let next = t.peer.open_sent().await;
        assert_eq!(next, BgpState::Idle);
        assert_eq!(t.peer.connect_retry_counter, 1);
        assert!(t.peer.conn.is_none());

        // HoldTimeExpired NOTIFICATION went out before the close
        let mut buf = [0u8; 21];
        t.remote_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[18], 3); // NOTIFICATION
        assert_eq!(buf[19], 4); // HoldTimeExpired
        assert_eq!(buf[20], 0);
    }

    #[tokio::test]
    async fn test_open_sent_keepalive_is_fsm_error() {
        let mut t =
            create_test_peer_with_state(BgpState::OpenSent, ConnectionDirection::Incoming).await;
        t.peer.timers.start_hold_timer();

        let keepalive: Vec<u8> = {
            let mut m = vec![0xff; 16];
            m.extend_from_slice(&19u16.to_be_bytes());
            m.push(4);
            m
        };
        t.remote_stream.write_all(&keepalive).await.unwrap();

        let next = t.peer.open_sent().await;
        assert_eq!(next, BgpState::Idle);
        assert_eq!(t.peer.connect_retry_counter, 1);

        let mut buf = [0u8; 21];
        t.remote_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[19], 5); // FiniteStateMachineError
        assert_eq!(buf[20], 0);
    }

    #[tokio::test]
    async fn test_open_sent_decode_failure_sends_notification() {
        let mut t =
            create_test_peer_with_state(BgpState::OpenSent, ConnectionDirection::Incoming).await;
        t.peer.timers.start_hold_timer();

        // Version 3 OPEN from the neighbor
        let mut open = OpenMessage::new(65001, 30, 0x02020202).serialize();
        open[19] = 0x03;
        t.remote_stream.write_all(&open).await.unwrap();

        let next = t.peer.open_sent().await;
        assert_eq!(next, BgpState::Idle);
        assert_eq!(t.peer.connect_retry_counter, 1);

        let mut buf = [0u8; 21];
        t.remote_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[19], 2); // OpenMessageError
        assert_eq!(buf[20], 1); // UnsupportedVersionNumber
    }

    #[tokio::test]
    async fn test_open_sent_connection_loss_goes_active() {
        let mut t =
            create_test_peer_with_state(BgpState::OpenSent, ConnectionDirection::Incoming).await;
        t.peer.timers.start_hold_timer();

        drop(t.remote_stream);

        let next = t.peer.open_sent().await;
        assert_eq!(next, BgpState::Active);
        assert!(t.peer.conn.is_none());
        assert!(t.peer.timers.connect_retry_deadline().is_some());
    }

    #[tokio::test]
    async fn test_open_sent_manual_stop() {
        let mut t =
            create_test_peer_with_state(BgpState::OpenSent, ConnectionDirection::Incoming).await;
        t.peer.timers.start_hold_timer();
        t.peer.connect_retry_counter = 4;
        t.op_tx.send(PeerOp::ManualStop).unwrap();

        let next = t.peer.open_sent().await;
        assert_eq!(next, BgpState::Idle);
        assert_eq!(t.peer.connect_retry_counter, 0);

        let mut buf = [0u8; 21];
        t.remote_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[19], 6); // Cease
        assert_eq!(buf[20], 0);
    }
}
