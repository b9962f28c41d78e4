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

//! Per-peer BGP session state machine.
//!
//! One task per configured neighbor runs the FSM loop, multiplexing over
//! administrative events, its one-shot timers, inbound connections, decoded
//! messages, and read failures. A connector helper task performs outbound
//! dials; a reader helper task per active connection frames and decodes
//! inbound messages. During collision resolution two connections are
//! tracked until the remote router-id is learned.

use crate::bgp::msg::{BgpMessage, Message};
use crate::bgp::msg_keepalive::KeepAliveMessage;
use crate::bgp::msg_notification::{
    BgpError, NotificationMessage, CONNECTION_COLLISION_RESOLUTION,
};
use crate::bgp::msg_open::OpenMessage;
use crate::bgp::utils::ParserError;
use crate::config::PeerConfig;
use crate::lpm::Lpm;
use crate::net::Prefix;
use crate::{info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

mod conn;
mod fsm;
mod state_active;
mod state_connect;
mod state_established;
mod state_idle;
mod state_openconfirm;
mod state_opensent;

pub use fsm::{BgpState, FsmTimers};

pub(crate) use conn::{Connection, ConnectionDirection};

/// RFC 4271: hold time used between sending an OPEN and completing the
/// negotiation.
const INITIAL_HOLD_TIME: Duration = Duration::from_secs(240);

/// Administrative events and queries delivered to a peer task.
pub enum PeerOp {
    ManualStart,
    ManualStop,
    AutomaticStart,
    ManualStartPassive,
    AutomaticStartPassive,
    AutomaticStop,
    GetState(oneshot::Sender<BgpState>),
    GetRoutes(oneshot::Sender<Vec<Prefix>>),
}

/// One decoded message, or decode failure, from a connection reader.
pub(crate) struct RecvMsg {
    pub conn_id: u64,
    pub msg: Result<BgpMessage, ParserError>,
}

/// Read failure that terminated a connection reader.
pub(crate) struct RecvFail {
    pub conn_id: u64,
    pub error: String,
}

pub struct Peer {
    pub(crate) remote: Ipv4Addr,
    pub(crate) local: Ipv4Addr,
    pub(crate) local_asn: u16,
    pub(crate) router_id: u32,
    pub(crate) neighbor_id: u32,
    pub(crate) passive: bool,

    pub(crate) state: BgpState,
    pub(crate) last_state: BgpState,
    pub(crate) state_reason: String,

    pub(crate) timers: FsmTimers,
    pub(crate) hold_time_configured: Duration,
    pub(crate) connect_retry_counter: u32,

    /// Primary connection, and the second candidate tracked during
    /// collision resolution.
    pub(crate) conn: Option<Connection>,
    pub(crate) conn_collision: Option<Connection>,

    /// Routes learned from this peer. Exists only in Established.
    pub(crate) adj_rib_in: Option<Lpm>,

    pub(crate) op_rx: mpsc::UnboundedReceiver<PeerOp>,
    pub(crate) conn_rx: mpsc::Receiver<Connection>,
    pub(crate) conn_err_rx: mpsc::Receiver<io::Error>,
    pub(crate) initiate_tx: mpsc::Sender<()>,
    pub(crate) msg_tx: mpsc::Sender<RecvMsg>,
    pub(crate) msg_rx: mpsc::Receiver<RecvMsg>,
    pub(crate) msg_fail_tx: mpsc::Sender<RecvFail>,
    pub(crate) msg_fail_rx: mpsc::Receiver<RecvFail>,
    pub(crate) dying: watch::Receiver<bool>,
}

/// Handle to a running peer task.
pub struct PeerHandle {
    op_tx: mpsc::UnboundedSender<PeerOp>,
    conn_tx: mpsc::Sender<Connection>,
    dying_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    /// Starts the session (ManualStart).
    pub fn start(&self) {
        let _ = self.op_tx.send(PeerOp::ManualStart);
    }

    pub fn send_op(&self, op: PeerOp) {
        let _ = self.op_tx.send(op);
    }

    /// Stops the peer: enqueues ManualStop, marks the task group dying, and
    /// waits for the FSM task to finish.
    pub async fn stop(self) {
        let _ = self.op_tx.send(PeerOp::ManualStop);
        let _ = self.dying_tx.send(true);
        let _ = self.task.await;
    }

    pub async fn state(&self) -> Option<BgpState> {
        let (tx, rx) = oneshot::channel();
        self.op_tx.send(PeerOp::GetState(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn routes(&self) -> Option<Vec<Prefix>> {
        let (tx, rx) = oneshot::channel();
        self.op_tx.send(PeerOp::GetRoutes(tx)).ok()?;
        rx.await.ok()
    }

    /// Hands an accepted inbound TCP connection to the peer task.
    pub async fn deliver(&self, stream: TcpStream) -> bool {
        match Connection::new(stream, ConnectionDirection::Incoming) {
            Ok(conn) => self.conn_tx.send(conn).await.is_ok(),
            Err(_) => false,
        }
    }
}

impl Peer {
    /// Spawns the FSM task and its connector helper for one configured
    /// neighbor. The peer starts in Idle and waits for a start event.
    pub fn spawn(config: PeerConfig, connect_retry_time: Duration) -> PeerHandle {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::channel(4);
        let (conn_err_tx, conn_err_rx) = mpsc::channel(4);
        let (initiate_tx, initiate_rx) = mpsc::channel(1);
        let (msg_tx, msg_rx) = mpsc::channel(64);
        let (msg_fail_tx, msg_fail_rx) = mpsc::channel(4);
        let (dying_tx, dying_rx) = watch::channel(false);

        let peer_addr = SocketAddr::new(IpAddr::V4(config.peer_address), config.peer_port);
        tokio::spawn(conn::tcp_connector(
            config.local_address,
            peer_addr,
            initiate_rx,
            conn_tx.clone(),
            conn_err_tx,
            dying_rx.clone(),
        ));

        let hold_time = Duration::from_secs(config.hold_timer);
        let peer = Peer {
            remote: config.peer_address,
            local: config.local_address,
            local_asn: config.local_as,
            router_id: u32::from(config.router_id),
            neighbor_id: 0,
            passive: config.passive,
            state: BgpState::Idle,
            last_state: BgpState::Idle,
            state_reason: String::new(),
            timers: FsmTimers::new(
                connect_retry_time,
                hold_time,
                Duration::from_secs(config.keep_alive),
            ),
            hold_time_configured: hold_time,
            connect_retry_counter: 0,
            conn: None,
            conn_collision: None,
            adj_rib_in: None,
            op_rx,
            conn_rx,
            conn_err_rx,
            initiate_tx,
            msg_tx,
            msg_rx,
            msg_fail_tx,
            msg_fail_rx,
            dying: dying_rx,
        };
        let task = tokio::spawn(peer.run());

        PeerHandle {
            op_tx,
            conn_tx,
            dying_tx,
            task,
        }
    }

    /// Main peer task: runs the current state's handler until the terminal
    /// Cease state is reached.
    pub async fn run(mut self) {
        info!("starting peer task", "peer" => self.remote.to_string());
        loop {
            match self.state {
                BgpState::Idle => {
                    self.idle().await;
                }
                BgpState::Connect => {
                    self.connect().await;
                }
                BgpState::Active => {
                    self.active().await;
                }
                BgpState::OpenSent => {
                    self.open_sent().await;
                }
                BgpState::OpenConfirm => {
                    self.open_confirm().await;
                }
                BgpState::Established => {
                    self.established().await;
                }
                BgpState::Cease => break,
            }
        }
        self.disconnect();
        info!("peer task stopped",
            "peer" => self.remote.to_string(),
            "last_state" => self.last_state.as_str(),
            "reason" => &self.state_reason);
    }

    pub(crate) fn change_state(&mut self, new: BgpState, reason: impl Into<String>) -> BgpState {
        let reason = reason.into();
        info!("neighbor state change",
            "peer" => self.remote.to_string(),
            "last_state" => self.state.as_str(),
            "new_state" => new.as_str(),
            "reason" => &reason);
        self.last_state = self.state;
        self.state = new;
        self.state_reason = reason;
        new
    }

    /// Closes both tracked connections.
    pub(crate) fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        if let Some(conn) = self.conn_collision.take() {
            conn.close();
        }
    }

    /// Asks the connector helper for an outbound dial. A request already in
    /// flight is not duplicated.
    pub(crate) fn initiate_connect(&self) {
        let _ = self.initiate_tx.try_send(());
    }

    fn open_message(&self) -> OpenMessage {
        OpenMessage::new(
            self.local_asn,
            self.hold_time_configured.as_secs() as u16,
            self.router_id,
        )
    }

    pub(crate) async fn send_open(&mut self) -> io::Result<()> {
        let bytes = self.open_message().serialize();
        match self.conn.as_mut() {
            Some(conn) => conn.send(&bytes).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no TCP connection",
            )),
        }
    }

    pub(crate) async fn send_keepalive(&mut self) -> io::Result<()> {
        let bytes = KeepAliveMessage {}.serialize();
        match self.conn.as_mut() {
            Some(conn) => conn.send(&bytes).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no TCP connection",
            )),
        }
    }

    /// Sends a NOTIFICATION on the primary connection; send failures are
    /// irrelevant since the connection is about to go away.
    pub(crate) async fn notify_primary(&mut self, error: BgpError) {
        let bytes = NotificationMessage::new(error).serialize();
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.send(&bytes).await;
        }
    }

    /// Sends a NOTIFICATION on every tracked connection.
    pub(crate) async fn notify_all(&mut self, error: BgpError) {
        let bytes = NotificationMessage::new(error).serialize();
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.send(&bytes).await;
        }
        if let Some(conn) = self.conn_collision.as_mut() {
            let _ = conn.send(&bytes).await;
        }
    }

    /// Starts the reader task on the primary connection.
    pub(crate) fn start_primary_reader(&mut self) {
        let msg_tx = self.msg_tx.clone();
        let fail_tx = self.msg_fail_tx.clone();
        let dying = self.dying.clone();
        if let Some(conn) = self.conn.as_mut() {
            conn.spawn_reader(msg_tx, fail_tx, dying);
        }
    }

    /// Tracks a second connection from the neighbor while the collision is
    /// unresolved. A third connection is dropped outright.
    pub(crate) async fn track_collision(&mut self, mut conn: Connection) {
        if self.conn_collision.is_some() {
            warn!("received third connection from peer, dropping new connection",
                "peer" => self.remote.to_string(),
                "local" => self.local.to_string());
            conn.close();
            return;
        }

        let open = self.open_message().serialize();
        if conn.send(&open).await.is_err() {
            conn.close();
            return;
        }
        conn.spawn_reader(
            self.msg_tx.clone(),
            self.msg_fail_tx.clone(),
            self.dying.clone(),
        );
        self.conn_collision = Some(conn);
    }

    /// True when `conn_id` refers to the connection that collision
    /// resolution would close: the higher router-id keeps the connection it
    /// initiated, the lower keeps the one it accepted.
    pub(crate) fn connection_doomed(&self, conn_id: u64) -> bool {
        let passive = if self.conn.as_ref().is_some_and(|c| c.id == conn_id) {
            self.conn.as_ref().map(|c| c.is_passive())
        } else if self.conn_collision.as_ref().is_some_and(|c| c.id == conn_id) {
            self.conn_collision.as_ref().map(|c| c.is_passive())
        } else {
            None
        };
        let Some(passive) = passive else {
            return false;
        };
        if self.router_id > self.neighbor_id {
            passive
        } else {
            !passive
        }
    }

    /// Closes the identified connection without touching session state,
    /// promoting the collision candidate if the primary went away.
    pub(crate) fn close_connection(&mut self, conn_id: u64) {
        if self.conn.as_ref().is_some_and(|c| c.id == conn_id) {
            if let Some(conn) = self.conn.take() {
                conn.close();
            }
            self.conn = self.conn_collision.take();
        } else if self.conn_collision.as_ref().is_some_and(|c| c.id == conn_id) {
            if let Some(conn) = self.conn_collision.take() {
                conn.close();
            }
        }
    }

    /// Absorbs a reader failure on one connection. Returns false only when
    /// the primary died with no survivor, which the state handlers treat as
    /// a TCP failure.
    pub(crate) fn collapse_failed_conn(&mut self, conn_id: u64) -> bool {
        if self.conn.as_ref().is_some_and(|c| c.id == conn_id) {
            if self.conn_collision.is_some() {
                if let Some(conn) = self.conn.take() {
                    conn.close();
                }
                self.conn = self.conn_collision.take();
                return true;
            }
            return false;
        }
        if self.conn_collision.as_ref().is_some_and(|c| c.id == conn_id) {
            if let Some(conn) = self.conn_collision.take() {
                conn.close();
            }
        }
        // A stale id belongs to a connection already closed
        true
    }

    /// RFC 4271 6.8: once both router-ids are known, keep exactly one of
    /// the two connections. The loser is told why.
    pub(crate) async fn resolve_collision(&mut self) {
        if self.conn_collision.is_none() {
            return;
        }

        let keep_initiator = self.router_id > self.neighbor_id;
        let primary_passive = self.conn.as_ref().map(|c| c.is_passive()).unwrap_or(false);
        let dump_primary = if keep_initiator {
            primary_passive
        } else {
            !primary_passive
        };

        if dump_primary {
            if let Some(mut conn) = self.conn.take() {
                info!("collision resolution: closing primary connection",
                    "peer" => self.remote.to_string(),
                    "conn" => conn.id);
                Self::dump_connection(&mut conn).await;
                conn.close();
            }
            self.conn = self.conn_collision.take();
            return;
        }

        let collision_passive = self
            .conn_collision
            .as_ref()
            .map(|c| c.is_passive())
            .unwrap_or(false);
        let dump_collision = if keep_initiator {
            collision_passive
        } else {
            !collision_passive
        };
        if dump_collision {
            if let Some(mut conn) = self.conn_collision.take() {
                info!("collision resolution: closing second connection",
                    "peer" => self.remote.to_string(),
                    "conn" => conn.id);
                Self::dump_connection(&mut conn).await;
                conn.close();
            }
        }
    }

    async fn dump_connection(conn: &mut Connection) {
        let bytes =
            NotificationMessage::new(BgpError::Cease(CONNECTION_COLLISION_RESOLUTION)).serialize();
        let _ = conn.send(&bytes).await;
    }

    /// Answers queries that are valid in every state; returns the op back
    /// when the state handler has to act on it.
    pub(crate) fn handle_common_op(&mut self, op: PeerOp) -> Option<PeerOp> {
        match op {
            PeerOp::GetState(tx) => {
                let _ = tx.send(self.state);
                None
            }
            PeerOp::GetRoutes(tx) => {
                let routes = self
                    .adj_rib_in
                    .as_ref()
                    .map(|rib| rib.dump())
                    .unwrap_or_default();
                let _ = tx.send(routes);
                None
            }
            other => Some(other),
        }
    }
}
