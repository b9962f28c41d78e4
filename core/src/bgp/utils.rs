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

use super::msg_notification::{BgpError, UpdateMessageError};
use crate::net::Prefix;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

/// Decode failure. The `BgpError` variant maps directly onto a NOTIFICATION
/// (error code + subcode) plus a human-readable message; `IoError` is a
/// transport failure; `ParseError` is a local validation failure that never
/// goes on the wire.
#[derive(Debug, PartialEq)]
pub enum ParserError {
    IoError(String),
    ParseError(String),
    BgpError { error: BgpError, message: String },
}

impl ParserError {
    pub fn bgp(error: BgpError, message: impl Into<String>) -> Self {
        ParserError::BgpError {
            error,
            message: message.into(),
        }
    }
}

impl Display for ParserError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ParserError::IoError(s) => write!(f, "IO error: {}", s),
            ParserError::ParseError(s) => write!(f, "parse error: {}", s),
            ParserError::BgpError { error, message } => {
                write!(f, "BGP error {:?}: {}", error, message)
            }
        }
    }
}

impl Error for ParserError {}

/// Parses a run of NLRI entries: one length octet followed by
/// `ceil(pfxlen/8)` address octets, expanded to four octets with trailing
/// zeros.
pub fn parse_nlri_list(bytes: &[u8]) -> Result<Vec<Prefix>, ParserError> {
    let mut cursor = 0;
    let mut nlri_list = Vec::new();

    while cursor < bytes.len() {
        let prefix_length = bytes[cursor];
        cursor += 1;

        if prefix_length > 32 {
            return Err(ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::InvalidNetworkField),
                format!("invalid NLRI prefix length: {}", prefix_length),
            ));
        }

        let byte_len = (prefix_length as usize + 7) / 8;
        if cursor + byte_len > bytes.len() {
            return Err(ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::InvalidNetworkField),
                "truncated NLRI",
            ));
        }

        let mut ip_buffer = [0u8; 4];
        ip_buffer[..byte_len].copy_from_slice(&bytes[cursor..cursor + byte_len]);
        cursor += byte_len;

        nlri_list.push(Prefix::new(u32::from_be_bytes(ip_buffer), prefix_length));
    }

    Ok(nlri_list)
}

pub fn read_u32(bytes: &[u8]) -> Result<u32, ParserError> {
    if bytes.len() < 4 {
        return Err(ParserError::bgp(
            BgpError::UpdateMessageError(UpdateMessageError::AttributeLengthError),
            "attribute value shorter than four octets",
        ));
    }
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Validates a BGP identifier: must be a unicast IPv4 host address, so not
/// loopback, not multicast, first octet not zero, not 255.255.255.255.
pub fn is_valid_bgp_identifier(id: u32) -> bool {
    let addr = Ipv4Addr::from(id);
    !(addr.is_loopback() || addr.is_multicast() || addr.octets()[0] == 0 || addr.is_broadcast())
}
