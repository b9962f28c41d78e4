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

use crate::bgp::utils::is_valid_bgp_identifier;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Address the listener binds, conventionally "<local-ip>:179"
    pub listen_addr: String,
    #[serde(default = "default_connect_retry_time")]
    pub connect_retry_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeerConfig {
    pub peer_address: Ipv4Addr,
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    pub local_address: Ipv4Addr,
    pub local_as: u16,
    pub router_id: Ipv4Addr,
    #[serde(default = "default_hold_time")]
    pub hold_timer: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    /// Passive peers accept inbound connections and do not initiate
    #[serde(default = "default_passive")]
    pub passive: bool,
}

fn default_connect_retry_time() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_peer_port() -> u16 {
    crate::bgp::msg::BGP_PORT
}

fn default_hold_time() -> u64 {
    90
}

fn default_keep_alive() -> u64 {
    30
}

fn default_passive() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        for peer in &self.peers {
            if !is_valid_bgp_identifier(u32::from(peer.router_id)) {
                return Err(format!(
                    "router_id {} for peer {} is not a valid BGP identifier",
                    peer.router_id, peer.peer_address
                ));
            }
            if peer.hold_timer == 1 || peer.hold_timer == 2 {
                return Err(format!(
                    "hold_timer {} for peer {} is not acceptable",
                    peer.hold_timer, peer.peer_address
                ));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "127.0.0.1:179".to_string(),
            connect_retry_secs: default_connect_retry_time(),
            log_level: default_log_level(),
            peers: Vec::new(),
        }
    }
}
