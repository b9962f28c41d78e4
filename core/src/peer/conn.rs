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

//! Per-connection plumbing: the connection handle the FSM owns, the reader
//! task that frames and decodes inbound messages, and the connector task
//! that performs outbound dials.

use super::{fsm, RecvFail, RecvMsg};
use crate::bgp::msg::read_bgp_message;
use crate::bgp::utils::ParserError;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long helper tasks wait on a channel send before assuming the FSM has
/// moved on and dropping the payload.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// Accepted on the listening socket: the local side is the passive one
    /// (local port 179).
    Incoming,
    /// Dialed by the local side.
    Outgoing,
}

/// One TCP connection to the neighbor. Two of these can coexist during
/// collision resolution; the id disambiguates which one a reader event
/// came from.
pub struct Connection {
    pub id: u64,
    pub direction: ConnectionDirection,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    tx: OwnedWriteHalf,
    rx: Option<OwnedReadHalf>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(stream: TcpStream, direction: ConnectionDirection) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (rx, tx) = stream.into_split();
        Ok(Connection {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            local_addr,
            peer_addr,
            tx,
            rx: Some(rx),
            reader: None,
        })
    }

    pub fn is_passive(&self) -> bool {
        self.direction == ConnectionDirection::Incoming
    }

    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.tx.write_all(bytes).await
    }

    /// Starts the framed-message reader for this connection. A second call
    /// is a no-op.
    pub fn spawn_reader(
        &mut self,
        msg_tx: mpsc::Sender<RecvMsg>,
        fail_tx: mpsc::Sender<RecvFail>,
        dying: watch::Receiver<bool>,
    ) {
        let Some(rx) = self.rx.take() else {
            return;
        };
        let id = self.id;
        self.reader = Some(tokio::spawn(read_loop(id, rx, msg_tx, fail_tx, dying)));
    }

    /// Tears the connection down. The socket closes when both halves drop;
    /// the reader is aborted so it does not report the close as a failure.
    pub fn close(self) {
        if let Some(handle) = self.reader {
            handle.abort();
        }
    }
}

/// Reads framed messages off one connection and forwards them to the FSM,
/// exiting on the first read failure.
async fn read_loop(
    conn_id: u64,
    mut rx: OwnedReadHalf,
    msg_tx: mpsc::Sender<RecvMsg>,
    fail_tx: mpsc::Sender<RecvFail>,
    mut dying: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = read_bgp_message(&mut rx) => match result {
                Ok(msg) => {
                    let event = RecvMsg { conn_id, msg: Ok(msg) };
                    match timeout(SEND_TIMEOUT, msg_tx.send(event)).await {
                        Ok(Ok(())) => {}
                        _ => return,
                    }
                }
                Err(ParserError::IoError(error)) => {
                    let _ = timeout(SEND_TIMEOUT, fail_tx.send(RecvFail { conn_id, error })).await;
                    return;
                }
                Err(err) => {
                    // Decode failure: the byte stream is no longer trustworthy,
                    // so hand the error over and stop reading
                    let event = RecvMsg { conn_id, msg: Err(err) };
                    let _ = timeout(SEND_TIMEOUT, msg_tx.send(event)).await;
                    return;
                }
            },
            _ = fsm::dying(&mut dying) => return,
        }
    }
}

/// Performs blocking outbound connects on request, delivering the resulting
/// connection or error back to the FSM.
pub(crate) async fn tcp_connector(
    local_ip: Ipv4Addr,
    peer_addr: SocketAddr,
    mut initiate_rx: mpsc::Receiver<()>,
    conn_tx: mpsc::Sender<Connection>,
    err_tx: mpsc::Sender<io::Error>,
    mut dying: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            request = initiate_rx.recv() => {
                if request.is_none() {
                    return;
                }
                let result = dial(local_ip, peer_addr)
                    .await
                    .and_then(|stream| Connection::new(stream, ConnectionDirection::Outgoing));
                match result {
                    Ok(conn) => {
                        let _ = timeout(SEND_TIMEOUT, conn_tx.send(conn)).await;
                    }
                    Err(err) => {
                        let _ = timeout(SEND_TIMEOUT, err_tx.send(err)).await;
                    }
                }
            }
            _ = fsm::dying(&mut dying) => return,
        }
    }
}

async fn dial(local_ip: Ipv4Addr, peer_addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::new(local_ip.into(), 0))?;
    socket.connect(peer_addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::msg::BgpMessage;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_reader_forwards_messages() {
        let (mut client, server) = socket_pair().await;
        let mut conn = Connection::new(server, ConnectionDirection::Incoming).unwrap();
        assert!(conn.is_passive());

        let (msg_tx, mut msg_rx) = mpsc::channel(4);
        let (fail_tx, _fail_rx) = mpsc::channel(4);
        let (_dying_tx, dying_rx) = watch::channel(false);
        conn.spawn_reader(msg_tx, fail_tx, dying_rx);

        // A KEEPALIVE on the wire arrives as a decoded message
        let keepalive: Vec<u8> = {
            let mut m = vec![0xff; 16];
            m.extend_from_slice(&19u16.to_be_bytes());
            m.push(4);
            m
        };
        client.write_all(&keepalive).await.unwrap();

        let received = msg_rx.recv().await.unwrap();
        assert_eq!(received.conn_id, conn.id);
        assert!(matches!(received.msg, Ok(BgpMessage::KeepAlive(_))));
    }

    #[tokio::test]
    async fn test_reader_reports_close_on_fail_channel() {
        let (client, server) = socket_pair().await;
        let mut conn = Connection::new(server, ConnectionDirection::Incoming).unwrap();

        let (msg_tx, _msg_rx) = mpsc::channel(4);
        let (fail_tx, mut fail_rx) = mpsc::channel(4);
        let (_dying_tx, dying_rx) = watch::channel(false);
        conn.spawn_reader(msg_tx, fail_tx, dying_rx);

        drop(client);

        let failure = fail_rx.recv().await.unwrap();
        assert_eq!(failure.conn_id, conn.id);
    }

    #[tokio::test]
    async fn test_reader_reports_decode_error_and_exits() {
        let (mut client, server) = socket_pair().await;
        let mut conn = Connection::new(server, ConnectionDirection::Incoming).unwrap();

        let (msg_tx, mut msg_rx) = mpsc::channel(4);
        let (fail_tx, _fail_rx) = mpsc::channel(4);
        let (_dying_tx, dying_rx) = watch::channel(false);
        conn.spawn_reader(msg_tx, fail_tx, dying_rx);

        // Garbage marker: ConnectionNotSynchronized
        let mut garbage = vec![0u8; 19];
        garbage[18] = 4;
        client.write_all(&garbage).await.unwrap();

        let received = msg_rx.recv().await.unwrap();
        assert!(received.msg.is_err());
    }

    #[tokio::test]
    async fn test_connector_delivers_error_for_refused_dial() {
        // Bind-then-drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let (initiate_tx, initiate_rx) = mpsc::channel(1);
        let (conn_tx, _conn_rx) = mpsc::channel::<Connection>(1);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let (_dying_tx, dying_rx) = watch::channel(false);

        tokio::spawn(tcp_connector(
            Ipv4Addr::new(127, 0, 0, 1),
            dead_addr,
            initiate_rx,
            conn_tx,
            err_tx,
            dying_rx,
        ));

        initiate_tx.send(()).await.unwrap();
        assert!(err_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_connector_exits_on_dying() {
        let (_initiate_tx, initiate_rx) = mpsc::channel(1);
        let (conn_tx, _conn_rx) = mpsc::channel::<Connection>(1);
        let (err_tx, _err_rx) = mpsc::channel(1);
        let (dying_tx, dying_rx) = watch::channel(false);

        let task = tokio::spawn(tcp_connector(
            Ipv4Addr::new(127, 0, 0, 1),
            "127.0.0.1:1".parse().unwrap(),
            initiate_rx,
            conn_tx,
            err_tx,
            dying_rx,
        ));

        dying_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
