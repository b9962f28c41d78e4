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

//! TCP front door: accepts inbound connections and routes each to the peer
//! task configured for its source address.

use crate::config::Config;
use crate::peer::{Peer, PeerHandle};
use crate::{info, warn};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug)]
pub enum ServerError {
    BindError(io::Error),
    AcceptError(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::BindError(e) => write!(f, "failed to bind listener: {}", e),
            ServerError::AcceptError(e) => write!(f, "failed to accept connection: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

pub struct BgpServer {
    config: Config,
    peers: HashMap<IpAddr, PeerHandle>,
}

impl BgpServer {
    pub fn new(config: Config) -> Self {
        BgpServer {
            config,
            peers: HashMap::new(),
        }
    }

    /// Spawns one peer task per configured neighbor, starts each, and
    /// accepts inbound connections forever.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(ServerError::BindError)?;

        let connect_retry = Duration::from_secs(self.config.connect_retry_secs);
        for peer_config in self.config.peers.clone() {
            let peer_ip = IpAddr::V4(peer_config.peer_address);
            let handle = Peer::spawn(peer_config, connect_retry);
            handle.start();
            self.peers.insert(peer_ip, handle);
        }

        info!("listening for BGP connections",
            "listen_addr" => &self.config.listen_addr,
            "peers" => self.peers.len());

        loop {
            let (stream, remote) = listener.accept().await.map_err(ServerError::AcceptError)?;
            match self.peers.get(&remote.ip()) {
                Some(handle) => {
                    if !handle.deliver(stream).await {
                        warn!("peer task not accepting connections",
                            "peer" => remote.ip().to_string());
                    }
                }
                None => {
                    warn!("connection from unknown peer, dropping",
                        "remote" => remote.to_string());
                    drop(stream);
                }
            }
        }
    }

    /// Stops every peer and waits for their tasks to finish.
    pub async fn shutdown(self) {
        for (_, handle) in self.peers {
            handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_unknown_source_is_dropped() {
        let config = Config {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Config::default()
        };

        // Bind the listener here so the ephemeral port is known, then run
        // the accept loop inline
        let listener = TcpListener::bind(&config.listen_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peers: HashMap<IpAddr, PeerHandle> = HashMap::new();

        tokio::spawn(async move {
            loop {
                let (stream, remote) = listener.accept().await.unwrap();
                if peers.get(&remote.ip()).is_none() {
                    drop(stream);
                }
            }
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // The server closes immediately; the read observes EOF
        let mut buf = [0u8; 1];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_server_spawns_configured_peers() {
        let config = Config {
            listen_addr: "127.0.0.1:0".to_string(),
            connect_retry_secs: 5,
            log_level: "info".to_string(),
            peers: vec![PeerConfig {
                peer_address: Ipv4Addr::new(127, 0, 0, 1),
                peer_port: 1790,
                local_address: Ipv4Addr::new(127, 0, 0, 1),
                local_as: 65000,
                router_id: Ipv4Addr::new(1, 1, 1, 1),
                hold_timer: 90,
                keep_alive: 30,
                passive: true,
            }],
        };

        let connect_retry = Duration::from_secs(config.connect_retry_secs);
        let mut peers = HashMap::new();
        for peer_config in config.peers.clone() {
            let peer_ip = IpAddr::V4(peer_config.peer_address);
            let handle = Peer::spawn(peer_config, connect_retry);
            handle.start();
            peers.insert(peer_ip, handle);
        }

        // The passive peer moves to Active after ManualStart
        let handle = peers.get(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))).unwrap();
        let mut state = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = handle.state().await;
            if state == Some(crate::peer::BgpState::Active) {
                break;
            }
        }
        assert_eq!(state, Some(crate::peer::BgpState::Active));

        for (_, handle) in peers {
            handle.stop().await;
        }
    }
}
