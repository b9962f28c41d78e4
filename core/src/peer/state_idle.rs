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
use super::{BgpState, Peer, PeerOp};
use crate::debug;

impl Peer {
    /// Idle: all resources released, Adj-RIB-In cleared, waiting for a
    /// start event. Inbound connections are refused.
    pub(super) async fn idle(&mut self) -> BgpState {
        self.adj_rib_in = None;
        self.disconnect();

        loop {
            tokio::select! {
                Some(conn) = self.conn_rx.recv() => {
                    debug!("closing connection received in Idle",
                        "peer" => self.remote.to_string());
                    conn.close();
                }
                Some(_) = self.conn_err_rx.recv() => {
                    // Stale dial result from a previous incarnation
                }
                Some(op) = self.op_rx.recv() => {
                    let Some(op) = self.handle_common_op(op) else { continue };
                    let reason = match op {
                        PeerOp::ManualStart => "received ManualStart event",
                        PeerOp::AutomaticStart => "received AutomaticStart event",
                        PeerOp::ManualStartPassive => {
                            self.passive = true;
                            "received ManualStart event for passive peer"
                        }
                        PeerOp::AutomaticStartPassive => {
                            self.passive = true;
                            "received AutomaticStart event for passive peer"
                        }
                        _ => continue,
                    };

                    self.connect_retry_counter = 0;
                    self.timers.start_connect_retry();
                    if self.passive {
                        return self.change_state(BgpState::Active, reason);
                    }
                    self.initiate_connect();
                    return self.change_state(BgpState::Connect, reason);
                }
                _ = fsm::dying(&mut self.dying) => {
                    return self.change_state(BgpState::Cease, "shutdown requested");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use super::super::ConnectionDirection;
    use super::*;

    #[tokio::test]
    async fn test_idle_manual_start_passive() {
        let mut t =
            create_test_peer_with_state(BgpState::Idle, ConnectionDirection::Incoming).await;
        t.peer.passive = true;
        t.op_tx.send(PeerOp::ManualStart).unwrap();

        let next = t.peer.idle().await;
        assert_eq!(next, BgpState::Active);
        assert_eq!(t.peer.connect_retry_counter, 0);
        assert!(t.peer.timers.connect_retry_deadline().is_some());
        assert!(t.peer.adj_rib_in.is_none());
    }

    #[tokio::test]
    async fn test_idle_manual_start_active_peer() {
        let mut t =
            create_test_peer_with_state(BgpState::Idle, ConnectionDirection::Incoming).await;
        t.peer.passive = false;
        t.op_tx.send(PeerOp::ManualStart).unwrap();

        let next = t.peer.idle().await;
        assert_eq!(next, BgpState::Connect);
    }

    #[tokio::test]
    async fn test_idle_passive_start_forces_passive() {
        let mut t =
            create_test_peer_with_state(BgpState::Idle, ConnectionDirection::Incoming).await;
        t.peer.passive = false;
        t.op_tx.send(PeerOp::AutomaticStartPassive).unwrap();

        let next = t.peer.idle().await;
        assert_eq!(next, BgpState::Active);
        assert!(t.peer.passive);
    }

    #[tokio::test]
    async fn test_idle_ignores_stop_events() {
        let mut t =
            create_test_peer_with_state(BgpState::Idle, ConnectionDirection::Incoming).await;
        t.op_tx.send(PeerOp::ManualStop).unwrap();
        t.op_tx.send(PeerOp::AutomaticStop).unwrap();
        t.op_tx.send(PeerOp::ManualStart).unwrap();

        // The stop events are swallowed; the start still lands
        let next = t.peer.idle().await;
        assert_eq!(next, BgpState::Active);
    }

    #[tokio::test]
    async fn test_idle_dying_reaches_cease() {
        let mut t =
            create_test_peer_with_state(BgpState::Idle, ConnectionDirection::Incoming).await;
        t.dying_tx.send(true).unwrap();

        let next = t.peer.idle().await;
        assert_eq!(next, BgpState::Cease);
    }

    #[tokio::test]
    async fn test_idle_clears_rib() {
        let mut t =
            create_test_peer_with_state(BgpState::Idle, ConnectionDirection::Incoming).await;
        t.peer.adj_rib_in = Some(crate::lpm::Lpm::new());
        t.dying_tx.send(true).unwrap();

        t.peer.idle().await;
        assert!(t.peer.adj_rib_in.is_none());
    }
}
