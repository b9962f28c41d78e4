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

use super::msg_keepalive::KeepAliveMessage;
use super::msg_notification::{BgpError, MessageHeaderError, NotificationMessage};
use super::msg_open::OpenMessage;
use super::msg_update::UpdateMessage;
use super::utils::ParserError;
use tokio::io::AsyncReadExt;

pub const BGP_PORT: u16 = 179;

pub const BGP_HEADER_SIZE_BYTES: usize = 19;
pub const MAX_MESSAGE_SIZE: u16 = 4096;

// BGP header marker (16 bytes of 0xFF)
pub const BGP_MARKER: [u8; 16] = [0xff; 16];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    OPEN = 1,
    UPDATE = 2,
    NOTIFICATION = 3,
    KEEPALIVE = 4,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ParserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::OPEN),
            2 => Ok(MessageType::UPDATE),
            3 => Ok(MessageType::NOTIFICATION),
            4 => Ok(MessageType::KEEPALIVE),
            _ => Err(ParserError::bgp(
                BgpError::MessageHeaderError(MessageHeaderError::BadMessageType),
                format!("invalid message type: {}", value),
            )),
        }
    }
}

/// Trait for BGP message types that can serialize themselves
pub trait Message {
    /// Returns the message type identifier
    fn kind(&self) -> MessageType;

    /// Serializes the message body (without BGP header)
    fn to_bytes(&self) -> Vec<u8>;

    /// Serializes the complete BGP message with header
    fn serialize(&self) -> Vec<u8> {
        let body = self.to_bytes();
        let mut message = Vec::new();

        message.extend_from_slice(&BGP_MARKER);

        let length = BGP_HEADER_SIZE_BYTES as u16 + body.len() as u16;
        message.extend_from_slice(&length.to_be_bytes());

        message.push(self.kind().as_u8());
        message.extend_from_slice(&body);

        message
    }
}

#[derive(Debug, PartialEq)]
pub struct BgpHeader {
    pub length: u16,
    pub msg_type: MessageType,
}

/// Validates a 19-byte message header (RFC 4271 Section 6.1): marker, length
/// bounds, message type, and type-specific length minimums.
pub fn decode_header(header: &[u8; BGP_HEADER_SIZE_BYTES]) -> Result<BgpHeader, ParserError> {
    if header[0..16] != BGP_MARKER {
        return Err(ParserError::bgp(
            BgpError::MessageHeaderError(MessageHeaderError::ConnectionNotSynchronized),
            "invalid marker",
        ));
    }

    let length = u16::from_be_bytes([header[16], header[17]]);
    if length < BGP_HEADER_SIZE_BYTES as u16 || length > MAX_MESSAGE_SIZE {
        return Err(ParserError::bgp(
            BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
            format!("invalid length in BGP header: {}", length),
        ));
    }

    let msg_type = MessageType::try_from(header[18])?;

    let min_length = match msg_type {
        MessageType::OPEN => 29,
        MessageType::NOTIFICATION => 21,
        _ => BGP_HEADER_SIZE_BYTES as u16,
    };
    if length < min_length || (msg_type == MessageType::KEEPALIVE && length != 19) {
        return Err(ParserError::bgp(
            BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
            format!("invalid length {} for message type {:?}", length, msg_type),
        ));
    }

    Ok(BgpHeader { length, msg_type })
}

#[derive(Debug, PartialEq)]
pub enum BgpMessage {
    Open(OpenMessage),
    Update(UpdateMessage),
    KeepAlive(KeepAliveMessage),
    Notification(NotificationMessage),
}

impl BgpMessage {
    /// Decodes a message body whose header already passed validation. The
    /// header length is authoritative: `bytes` is exactly the body.
    pub fn from_bytes(msg_type: MessageType, bytes: Vec<u8>) -> Result<Self, ParserError> {
        match msg_type {
            MessageType::OPEN => Ok(BgpMessage::Open(OpenMessage::from_bytes(bytes)?)),
            MessageType::UPDATE => Ok(BgpMessage::Update(UpdateMessage::from_bytes(bytes)?)),
            MessageType::KEEPALIVE => Ok(BgpMessage::KeepAlive(KeepAliveMessage {})),
            MessageType::NOTIFICATION => Ok(BgpMessage::Notification(
                NotificationMessage::from_bytes(bytes)?,
            )),
        }
    }
}

/// Reads one framed BGP message off a byte stream: header, validation, body,
/// dispatch.
pub async fn read_bgp_message<R: AsyncReadExt + Unpin>(
    mut stream: R,
) -> Result<BgpMessage, ParserError> {
    let mut header_buffer = [0u8; BGP_HEADER_SIZE_BYTES];
    stream
        .read_exact(&mut header_buffer)
        .await
        .map_err(|err| ParserError::IoError(err.to_string()))?;

    let header = decode_header(&header_buffer)?;

    let body_length = header.length as usize - BGP_HEADER_SIZE_BYTES;
    let mut message_buffer = vec![0u8; body_length];
    if body_length > 0 {
        stream
            .read_exact(&mut message_buffer)
            .await
            .map_err(|err| ParserError::IoError(err.to_string()))?;
    }

    BgpMessage::from_bytes(header.msg_type, message_buffer)
}
