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

use super::msg::{Message, MessageType};
use super::msg_notification::{BgpError, OpenMessageError};
use super::utils::{is_valid_bgp_identifier, ParserError};

pub const BGP_VERSION: u8 = 4;

/// OPEN message. Optional parameters are not recognized by this speaker:
/// `opt_parm_len` bytes are validated for presence and skipped on decode,
/// and outgoing OPENs never carry any.
#[derive(Debug, PartialEq)]
pub struct OpenMessage {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_identifier: u32,
    pub opt_parm_len: u8,
}

/// Validate BGP version (RFC 4271 Section 6.2)
fn validate_version(version: u8) -> Result<(), ParserError> {
    if version != BGP_VERSION {
        return Err(ParserError::bgp(
            BgpError::OpenMessageError(OpenMessageError::UnsupportedVersionNumber),
            format!("unsupported version number: {}", version),
        ));
    }
    Ok(())
}

/// Validate Hold Time (RFC 4271 Section 6.2)
/// MUST reject Hold Time values of one or two seconds
fn validate_hold_time(hold_time: u16) -> Result<(), ParserError> {
    if hold_time == 1 || hold_time == 2 {
        return Err(ParserError::bgp(
            BgpError::OpenMessageError(OpenMessageError::UnacceptedHoldTime),
            format!("unacceptable hold time: {}", hold_time),
        ));
    }
    Ok(())
}

/// Validate BGP Identifier (RFC 4271 Section 6.2)
/// Must be a valid unicast IP host address
fn validate_bgp_identifier(bgp_identifier: u32) -> Result<(), ParserError> {
    if !is_valid_bgp_identifier(bgp_identifier) {
        return Err(ParserError::bgp(
            BgpError::OpenMessageError(OpenMessageError::BadBgpIdentifier),
            "invalid BGP identifier",
        ));
    }
    Ok(())
}

impl OpenMessage {
    /// Creates an OPEN with version 4 and no optional parameters.
    pub fn new(asn: u16, hold_time: u16, bgp_identifier: u32) -> Self {
        OpenMessage {
            version: BGP_VERSION,
            asn,
            hold_time,
            bgp_identifier,
            opt_parm_len: 0,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ParserError> {
        if bytes.len() < 10 {
            return Err(ParserError::ParseError(format!(
                "OPEN message body too short: {} bytes",
                bytes.len()
            )));
        }

        let version = bytes[0];
        let asn = u16::from_be_bytes([bytes[1], bytes[2]]);
        let hold_time = u16::from_be_bytes([bytes[3], bytes[4]]);
        let bgp_identifier = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let opt_parm_len = bytes[9];

        if opt_parm_len as usize != bytes.len() - 10 {
            return Err(ParserError::ParseError(format!(
                "optional parameter length {} does not match remaining {} bytes",
                opt_parm_len,
                bytes.len() - 10
            )));
        }

        // RFC 4271 Section 6.2: validate OPEN message fields. The optional
        // parameter bytes themselves are skipped.
        validate_version(version)?;
        validate_hold_time(hold_time)?;
        validate_bgp_identifier(bgp_identifier)?;

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            bgp_identifier,
            opt_parm_len,
        })
    }
}

impl Message for OpenMessage {
    fn kind(&self) -> MessageType {
        MessageType::OPEN
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(self.version);
        bytes.extend_from_slice(&self.asn.to_be_bytes());
        bytes.extend_from_slice(&self.hold_time.to_be_bytes());
        bytes.extend_from_slice(&self.bgp_identifier.to_be_bytes());
        bytes.push(0); // no optional parameters
        bytes
    }
}
