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

//! Session-level tests: a raw-socket harness plays the remote BGP speaker
//! against a spawned peer task and observes its state and Adj-RIB-In.

use bgpcore::config::PeerConfig;
use bgpcore::net::Prefix;
use bgpcore::peer::{BgpState, Peer, PeerHandle};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn peer_config(peer_port: u16, passive: bool) -> PeerConfig {
    PeerConfig {
        peer_address: Ipv4Addr::new(127, 0, 0, 1),
        peer_port,
        local_address: Ipv4Addr::new(127, 0, 0, 1),
        local_as: 65000,
        router_id: Ipv4Addr::new(1, 1, 1, 1),
        hold_timer: 90,
        keep_alive: 30,
        passive,
    }
}

fn open_bytes(asn: u16, hold_time: u16, router_id: [u8; 4]) -> Vec<u8> {
    let mut msg = vec![0xff; 16];
    msg.extend_from_slice(&29u16.to_be_bytes());
    msg.push(1);
    msg.push(4);
    msg.extend_from_slice(&asn.to_be_bytes());
    msg.extend_from_slice(&hold_time.to_be_bytes());
    msg.extend_from_slice(&router_id);
    msg.push(0);
    msg
}

fn keepalive_bytes() -> Vec<u8> {
    let mut msg = vec![0xff; 16];
    msg.extend_from_slice(&19u16.to_be_bytes());
    msg.push(4);
    msg
}

/// UPDATE with mandatory attributes, the given withdrawals, and the given
/// announcements. Prefix octet lists carry only the significant bytes.
fn update_bytes(withdrawn: &[(u8, &[u8])], announced: &[(u8, &[u8])]) -> Vec<u8> {
    let attrs: Vec<u8> = if announced.is_empty() {
        Vec::new()
    } else {
        vec![
            0x40, 0x01, 0x01, 0x02, // ORIGIN INCOMPLETE
            0x40, 0x02, 0x06, 0x02, 0x02, 0x3b, 0x41, 0x0c, 0xf8, // AS_SEQUENCE(15169, 3320)
            0x40, 0x03, 0x04, 10, 11, 12, 13, // NEXT_HOP
        ]
    };

    let mut withdrawn_octets = Vec::new();
    for (len, octets) in withdrawn {
        withdrawn_octets.push(*len);
        withdrawn_octets.extend_from_slice(octets);
    }
    let mut nlri = Vec::new();
    for (len, octets) in announced {
        nlri.push(*len);
        nlri.extend_from_slice(octets);
    }

    let mut body = Vec::new();
    body.extend_from_slice(&(withdrawn_octets.len() as u16).to_be_bytes());
    body.extend_from_slice(&withdrawn_octets);
    body.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    body.extend_from_slice(&attrs);
    body.extend_from_slice(&nlri);

    let mut msg = vec![0xff; 16];
    msg.extend_from_slice(&((19 + body.len()) as u16).to_be_bytes());
    msg.push(2);
    msg.extend_from_slice(&body);
    msg
}

async fn read_message(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 19];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut header))
        .await
        .expect("timed out reading message header")
        .expect("failed to read message header");
    let length = u16::from_be_bytes([header[16], header[17]]) as usize;
    let mut msg = header.to_vec();
    if length > 19 {
        let mut body = vec![0u8; length - 19];
        timeout(TEST_TIMEOUT, stream.read_exact(&mut body))
            .await
            .expect("timed out reading message body")
            .expect("failed to read message body");
        msg.extend_from_slice(&body);
    }
    msg
}

async fn wait_for_state(handle: &PeerHandle, wanted: BgpState) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if handle.state().await == Some(wanted) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for state {}",
            wanted
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_routes(handle: &PeerHandle, wanted: &[Prefix]) -> Vec<Prefix> {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if let Some(routes) = handle.routes().await {
            if wanted.iter().all(|p| routes.contains(p)) {
                return routes;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for routes {:?}",
            wanted
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Walks a passive peer through the OPEN/KEEPALIVE handshake and returns
/// the established remote-side socket.
async fn establish_passive_session(handle: &PeerHandle, listener: &TcpListener) -> TcpStream {
    let addr = listener.local_addr().unwrap();
    let mut remote = TcpStream::connect(addr).await.unwrap();
    let (local, _) = listener.accept().await.unwrap();
    assert!(handle.deliver(local).await);

    // The peer answers the inbound connection with its OPEN
    let open = read_message(&mut remote).await;
    assert_eq!(open[18], 1);
    assert_eq!(u16::from_be_bytes([open[20], open[21]]), 65000);

    remote
        .write_all(&open_bytes(65001, 90, [2, 2, 2, 2]))
        .await
        .unwrap();

    // OPEN exchange complete: the peer confirms with a KEEPALIVE
    let keepalive = read_message(&mut remote).await;
    assert_eq!(keepalive[18], 4);

    remote.write_all(&keepalive_bytes()).await.unwrap();
    wait_for_state(handle, BgpState::Established).await;

    remote
}

#[tokio::test]
async fn test_passive_session_reaches_established() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handle = Peer::spawn(peer_config(179, true), Duration::from_secs(5));
    handle.start();
    wait_for_state(&handle, BgpState::Active).await;

    let _remote = establish_passive_session(&handle, &listener).await;

    handle.stop().await;
}

#[tokio::test]
async fn test_update_replay_into_adj_rib_in() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handle = Peer::spawn(peer_config(179, true), Duration::from_secs(5));
    handle.start();
    wait_for_state(&handle, BgpState::Active).await;
    let mut remote = establish_passive_session(&handle, &listener).await;

    // Announce 10.0.0.0/8 and 192.168.0.0/16
    remote
        .write_all(&update_bytes(&[], &[(8, &[10]), (16, &[192, 168])]))
        .await
        .unwrap();
    wait_for_routes(
        &handle,
        &[Prefix::new(0x0A000000, 8), Prefix::new(0xC0A80000, 16)],
    )
    .await;

    // Withdraw both and announce 11.0.0.0/8 in one UPDATE: the removals
    // apply before the insertion
    remote
        .write_all(&update_bytes(
            &[(8, &[10]), (16, &[192, 168])],
            &[(8, &[11])],
        ))
        .await
        .unwrap();
    let routes = wait_for_routes(&handle, &[Prefix::new(0x0B000000, 8)]).await;
    assert!(!routes.contains(&Prefix::new(0x0A000000, 8)));
    assert!(!routes.contains(&Prefix::new(0xC0A80000, 16)));

    handle.stop().await;
}

#[tokio::test]
async fn test_rib_cleared_on_session_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handle = Peer::spawn(peer_config(179, true), Duration::from_secs(5));
    handle.start();
    wait_for_state(&handle, BgpState::Active).await;
    let mut remote = establish_passive_session(&handle, &listener).await;

    remote
        .write_all(&update_bytes(&[], &[(8, &[10])]))
        .await
        .unwrap();
    wait_for_routes(&handle, &[Prefix::new(0x0A000000, 8)]).await;

    // NOTIFICATION tears the session down; entering Idle clears the RIB
    let mut notif = vec![0xff; 16];
    notif.extend_from_slice(&21u16.to_be_bytes());
    notif.push(3);
    notif.extend_from_slice(&[6, 0]);
    remote.write_all(&notif).await.unwrap();

    wait_for_state(&handle, BgpState::Idle).await;
    assert_eq!(handle.routes().await, Some(vec![]));

    handle.stop().await;
}

#[tokio::test]
async fn test_decode_failure_sends_notification_and_resets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handle = Peer::spawn(peer_config(179, true), Duration::from_secs(5));
    handle.start();
    wait_for_state(&handle, BgpState::Active).await;
    let mut remote = establish_passive_session(&handle, &listener).await;

    // Corrupt marker: ConnectionNotSynchronized
    let mut garbage = vec![0u8; 19];
    garbage[18] = 4;
    remote.write_all(&garbage).await.unwrap();

    let notif = read_message(&mut remote).await;
    assert_eq!(notif[18], 3);
    assert_eq!(notif[19], 1); // MessageHeaderError
    assert_eq!(notif[20], 1); // ConnectionNotSynchronized

    wait_for_state(&handle, BgpState::Idle).await;
    handle.stop().await;
}

/// Collision: the peer dialed us (outgoing primary) and we hand it a second
/// inbound connection. Our router-id is lower, so the peer keeps the
/// connection it initiated and closes the inbound one with Cease.
#[tokio::test]
async fn test_collision_keeps_initiated_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = Peer::spawn(peer_config(port, false), Duration::from_secs(5));
    handle.start();

    // The peer dials out: this is its primary, initiator-side connection
    let (mut conn_a, _) = listener.accept().await.unwrap();
    let open_a = read_message(&mut conn_a).await;
    assert_eq!(open_a[18], 1);

    // Second connection arrives while the peer is in OpenSent
    wait_for_state(&handle, BgpState::OpenSent).await;
    let addr = listener.local_addr().unwrap();
    let mut conn_b = TcpStream::connect(addr).await.unwrap();
    let (local_b, _) = listener.accept().await.unwrap();
    assert!(handle.deliver(local_b).await);

    // The peer answers the candidate with an OPEN as well
    let open_b = read_message(&mut conn_b).await;
    assert_eq!(open_b[18], 1);

    // Our OPEN on the primary: router-id 1.0.0.1 < the peer's 1.1.1.1, so
    // the initiated connection (conn_a) wins
    conn_a
        .write_all(&open_bytes(65001, 90, [1, 0, 0, 1]))
        .await
        .unwrap();

    // The loser receives NOTIFICATION Cease/ConnectionCollisionResolution
    let notif = read_message(&mut conn_b).await;
    assert_eq!(notif[18], 3);
    assert_eq!(notif[19], 6);
    assert_eq!(notif[20], 7);

    // The session continues on conn_a
    let keepalive = read_message(&mut conn_a).await;
    assert_eq!(keepalive[18], 4);
    conn_a.write_all(&keepalive_bytes()).await.unwrap();
    wait_for_state(&handle, BgpState::Established).await;

    handle.stop().await;
}

/// Collision, mirrored: our router-id is higher, so the peer keeps the
/// passive (accepted) connection and closes the one it dialed.
#[tokio::test]
async fn test_collision_keeps_passive_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = Peer::spawn(peer_config(port, false), Duration::from_secs(5));
    handle.start();

    let (mut conn_a, _) = listener.accept().await.unwrap();
    let open_a = read_message(&mut conn_a).await;
    assert_eq!(open_a[18], 1);

    wait_for_state(&handle, BgpState::OpenSent).await;
    let addr = listener.local_addr().unwrap();
    let mut conn_b = TcpStream::connect(addr).await.unwrap();
    let (local_b, _) = listener.accept().await.unwrap();
    assert!(handle.deliver(local_b).await);

    let open_b = read_message(&mut conn_b).await;
    assert_eq!(open_b[18], 1);

    // Router-id 9.9.9.9 > the peer's 1.1.1.1: the passive side wins
    conn_a
        .write_all(&open_bytes(65001, 90, [9, 9, 9, 9]))
        .await
        .unwrap();

    // The dialed connection is the loser this time
    let notif = read_message(&mut conn_a).await;
    assert_eq!(notif[18], 3);
    assert_eq!(notif[19], 6);
    assert_eq!(notif[20], 7);

    // The peer's KEEPALIVE and the rest of the session run on conn_b
    let keepalive = read_message(&mut conn_b).await;
    assert_eq!(keepalive[18], 4);
    conn_b.write_all(&keepalive_bytes()).await.unwrap();
    wait_for_state(&handle, BgpState::Established).await;

    handle.stop().await;
}

/// A third connection while two are already tracked is dropped outright.
#[tokio::test]
async fn test_third_connection_is_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = Peer::spawn(peer_config(port, false), Duration::from_secs(5));
    handle.start();

    let (mut conn_a, _) = listener.accept().await.unwrap();
    read_message(&mut conn_a).await; // peer's OPEN

    wait_for_state(&handle, BgpState::OpenSent).await;
    let addr = listener.local_addr().unwrap();
    let mut conn_b = TcpStream::connect(addr).await.unwrap();
    let (local_b, _) = listener.accept().await.unwrap();
    assert!(handle.deliver(local_b).await);
    read_message(&mut conn_b).await; // peer's OPEN on the candidate

    // Third connection: dropped without a message
    let mut conn_c = TcpStream::connect(addr).await.unwrap();
    let (local_c, _) = listener.accept().await.unwrap();
    assert!(handle.deliver(local_c).await);

    let mut buf = [0u8; 1];
    let n = timeout(TEST_TIMEOUT, conn_c.read(&mut buf))
        .await
        .expect("timed out waiting for third connection close")
        .unwrap();
    assert_eq!(n, 0, "third connection must be closed without data");

    handle.stop().await;
}
