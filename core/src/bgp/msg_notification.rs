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
use super::utils::ParserError;

/// Cease subcode emitted when collision resolution closes the losing
/// connection (RFC 4486).
pub const CONNECTION_COLLISION_RESOLUTION: u8 = 7;

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageHeaderError {
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpenMessageError {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    // 5 is deprecated (was Authentication Failure)
    UnacceptedHoldTime = 6,
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UpdateMessageError {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    // 7 is deprecated (was AS Routing Loop)
    InvalidNextHopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BgpError {
    MessageHeaderError(MessageHeaderError),
    OpenMessageError(OpenMessageError),
    UpdateMessageError(UpdateMessageError),
    HoldTimerExpired,
    FiniteStateMachineError,
    Cease(u8),
}

impl BgpError {
    pub fn error_code(&self) -> u8 {
        match self {
            BgpError::MessageHeaderError(_) => 1,
            BgpError::OpenMessageError(_) => 2,
            BgpError::UpdateMessageError(_) => 3,
            BgpError::HoldTimerExpired => 4,
            BgpError::FiniteStateMachineError => 5,
            BgpError::Cease(_) => 6,
        }
    }

    pub fn error_subcode(&self) -> u8 {
        match self {
            BgpError::MessageHeaderError(err) => *err as u8,
            BgpError::OpenMessageError(err) => *err as u8,
            BgpError::UpdateMessageError(err) => *err as u8,
            BgpError::HoldTimerExpired => 0,
            BgpError::FiniteStateMachineError => 0,
            BgpError::Cease(subcode) => *subcode,
        }
    }

    /// Rebuilds an error from wire codes, enforcing the per-code subcode
    /// validity ranges (deprecated subcodes 2/5 and 3/7 rejected).
    pub fn from_codes(code: u8, subcode: u8) -> Result<Self, ParserError> {
        let invalid = || {
            Err(ParserError::ParseError(format!(
                "invalid NOTIFICATION error code/subcode: {}/{}",
                code, subcode
            )))
        };

        match code {
            1 => match subcode {
                1 => Ok(BgpError::MessageHeaderError(
                    MessageHeaderError::ConnectionNotSynchronized,
                )),
                2 => Ok(BgpError::MessageHeaderError(
                    MessageHeaderError::BadMessageLength,
                )),
                3 => Ok(BgpError::MessageHeaderError(
                    MessageHeaderError::BadMessageType,
                )),
                _ => invalid(),
            },
            2 => match subcode {
                1 => Ok(BgpError::OpenMessageError(
                    OpenMessageError::UnsupportedVersionNumber,
                )),
                2 => Ok(BgpError::OpenMessageError(OpenMessageError::BadPeerAs)),
                3 => Ok(BgpError::OpenMessageError(
                    OpenMessageError::BadBgpIdentifier,
                )),
                4 => Ok(BgpError::OpenMessageError(
                    OpenMessageError::UnsupportedOptionalParameter,
                )),
                6 => Ok(BgpError::OpenMessageError(
                    OpenMessageError::UnacceptedHoldTime,
                )),
                _ => invalid(),
            },
            3 => match subcode {
                1 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::MalformedAttributeList,
                )),
                2 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::UnrecognizedWellKnownAttribute,
                )),
                3 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::MissingWellKnownAttribute,
                )),
                4 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::AttributeFlagsError,
                )),
                5 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::AttributeLengthError,
                )),
                6 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::InvalidOriginAttribute,
                )),
                8 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::InvalidNextHopAttribute,
                )),
                9 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::OptionalAttributeError,
                )),
                10 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::InvalidNetworkField,
                )),
                11 => Ok(BgpError::UpdateMessageError(
                    UpdateMessageError::MalformedAsPath,
                )),
                _ => invalid(),
            },
            4 => match subcode {
                0 => Ok(BgpError::HoldTimerExpired),
                _ => invalid(),
            },
            5 => match subcode {
                0 => Ok(BgpError::FiniteStateMachineError),
                _ => invalid(),
            },
            6 => match subcode {
                0 | CONNECTION_COLLISION_RESOLUTION => Ok(BgpError::Cease(subcode)),
                _ => invalid(),
            },
            _ => invalid(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct NotificationMessage {
    error: BgpError,
}

impl NotificationMessage {
    pub fn new(error: BgpError) -> Self {
        NotificationMessage { error }
    }

    /// Converts a decode failure into the NOTIFICATION that reports it, if
    /// the failure maps onto a NOTIFICATION code.
    pub fn from_parser_error(error: &ParserError) -> Option<Self> {
        match error {
            ParserError::BgpError { error, .. } => Some(NotificationMessage::new(*error)),
            _ => None,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ParserError> {
        if bytes.len() < 2 {
            return Err(ParserError::ParseError(
                "NOTIFICATION body shorter than two octets".to_string(),
            ));
        }

        let error = BgpError::from_codes(bytes[0], bytes[1])?;
        Ok(NotificationMessage { error })
    }

    pub fn error(&self) -> &BgpError {
        &self.error
    }
}

impl Message for NotificationMessage {
    fn kind(&self) -> MessageType {
        MessageType::NOTIFICATION
    }

    fn to_bytes(&self) -> Vec<u8> {
        vec![self.error.error_code(), self.error.error_subcode()]
    }
}
