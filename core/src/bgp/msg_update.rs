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
use super::utils::{parse_nlri_list, read_u32, ParserError};
use crate::net::Prefix;
use std::net::Ipv4Addr;

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct PathAttrFlags(pub u8);

impl PathAttrFlags {
    pub const OPTIONAL: u8 = 1 << 7;
    pub const TRANSITIVE: u8 = 1 << 6;
    pub const PARTIAL: u8 = 1 << 5;
    pub const EXTENDED_LENGTH: u8 = 1 << 4;

    pub fn optional(&self) -> bool {
        self.0 & Self::OPTIONAL != 0
    }

    pub fn transitive(&self) -> bool {
        self.0 & Self::TRANSITIVE != 0
    }

    pub fn partial(&self) -> bool {
        self.0 & Self::PARTIAL != 0
    }

    pub fn extended_length(&self) -> bool {
        self.0 & Self::EXTENDED_LENGTH != 0
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum AttrType {
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,
}

impl TryFrom<u8> for AttrType {
    type Error = ParserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AttrType::Origin),
            2 => Ok(AttrType::AsPath),
            3 => Ok(AttrType::NextHop),
            4 => Ok(AttrType::MultiExitDisc),
            5 => Ok(AttrType::LocalPref),
            6 => Ok(AttrType::AtomicAggregate),
            7 => Ok(AttrType::Aggregator),
            _ => Err(ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::UnrecognizedWellKnownAttribute),
                format!("invalid attribute type code: {}", value),
            )),
        }
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl TryFrom<u8> for Origin {
    type Error = ParserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Origin::Igp),
            1 => Ok(Origin::Egp),
            2 => Ok(Origin::Incomplete),
            _ => Err(ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::InvalidOriginAttribute),
                format!("invalid ORIGIN value: {}", value),
            )),
        }
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AsPathSegmentType {
    AsSet = 1,
    AsSequence = 2,
}

impl TryFrom<u8> for AsPathSegmentType {
    type Error = ParserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AsPathSegmentType::AsSet),
            2 => Ok(AsPathSegmentType::AsSequence),
            _ => Err(ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::MalformedAsPath),
                format!("invalid AS path segment type: {}", value),
            )),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct AsPathSegment {
    pub segment_type: AsPathSegmentType,
    pub segment_len: u8,
    pub asn_list: Vec<u16>,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Aggregator {
    pub asn: u16,
    pub addr: Ipv4Addr,
}

#[derive(Debug, PartialEq, Clone)]
pub enum PathAttrValue {
    Origin(Origin),
    AsPath(Vec<AsPathSegment>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator(Aggregator),
}

#[derive(Debug, PartialEq, Clone)]
pub struct PathAttribute {
    pub flags: PathAttrFlags,
    pub value: PathAttrValue,
}

fn read_attr_as_path(bytes: &[u8]) -> Result<Vec<AsPathSegment>, ParserError> {
    let mut segments = Vec::new();
    let mut cursor = 0;

    while cursor < bytes.len() {
        if cursor + 2 > bytes.len() {
            return Err(ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::MalformedAsPath),
                "truncated AS path segment header",
            ));
        }
        let segment_type = AsPathSegmentType::try_from(bytes[cursor])?;
        let segment_len = bytes[cursor + 1];
        cursor += 2;

        if segment_len == 0 {
            return Err(ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::MalformedAsPath),
                "empty AS path segment",
            ));
        }

        if cursor + segment_len as usize * 2 > bytes.len() {
            return Err(ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::MalformedAsPath),
                "truncated AS path segment",
            ));
        }

        let mut asn_list = Vec::with_capacity(segment_len as usize);
        for _ in 0..segment_len {
            asn_list.push(u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]));
            cursor += 2;
        }

        segments.push(AsPathSegment {
            segment_type,
            segment_len,
            asn_list,
        });
    }

    Ok(segments)
}

fn read_attr_next_hop(bytes: &[u8]) -> Result<Ipv4Addr, ParserError> {
    if bytes.len() < 4 {
        return Err(ParserError::bgp(
            BgpError::UpdateMessageError(UpdateMessageError::AttributeLengthError),
            format!("invalid NEXT_HOP length: {}", bytes.len()),
        ));
    }
    Ok(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

fn read_attr_aggregator(bytes: &[u8]) -> Result<Aggregator, ParserError> {
    if bytes.len() < 6 {
        return Err(ParserError::bgp(
            BgpError::UpdateMessageError(UpdateMessageError::AttributeLengthError),
            format!("invalid AGGREGATOR length: {}", bytes.len()),
        ));
    }
    Ok(Aggregator {
        asn: u16::from_be_bytes([bytes[0], bytes[1]]),
        addr: Ipv4Addr::new(bytes[2], bytes[3], bytes[4], bytes[5]),
    })
}

/// Decodes one path attribute, returning it and the number of bytes it
/// occupied. The cursor always advances by the declared attribute length,
/// so excess trailing bytes inside a fixed-size attribute are drained and
/// the outer loop stays aligned.
fn read_path_attribute(bytes: &[u8]) -> Result<(PathAttribute, usize), ParserError> {
    if bytes.len() < 3 {
        return Err(ParserError::bgp(
            BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
            "truncated path attribute header",
        ));
    }

    let flags = PathAttrFlags(bytes[0]);
    let attr_type = AttrType::try_from(bytes[1])?;

    let (attr_len, header_len) = if flags.extended_length() {
        if bytes.len() < 4 {
            return Err(ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
                "truncated extended attribute length",
            ));
        }
        (u16::from_be_bytes([bytes[2], bytes[3]]) as usize, 4)
    } else {
        (bytes[2] as usize, 3)
    };

    if header_len + attr_len > bytes.len() {
        return Err(ParserError::bgp(
            BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
            "attribute length exceeds attribute list",
        ));
    }
    let attr_data = &bytes[header_len..header_len + attr_len];

    let value = match attr_type {
        AttrType::Origin => {
            if attr_len < 1 {
                return Err(ParserError::bgp(
                    BgpError::UpdateMessageError(UpdateMessageError::AttributeLengthError),
                    "ORIGIN attribute without value",
                ));
            }
            PathAttrValue::Origin(Origin::try_from(attr_data[0])?)
        }
        AttrType::AsPath => PathAttrValue::AsPath(read_attr_as_path(attr_data)?),
        AttrType::NextHop => PathAttrValue::NextHop(read_attr_next_hop(attr_data)?),
        AttrType::MultiExitDisc => PathAttrValue::MultiExitDisc(read_u32(attr_data)?),
        AttrType::LocalPref => PathAttrValue::LocalPref(read_u32(attr_data)?),
        AttrType::AtomicAggregate => {
            if attr_len != 0 {
                return Err(ParserError::bgp(
                    BgpError::UpdateMessageError(UpdateMessageError::AttributeLengthError),
                    format!("ATOMIC_AGGREGATE with non-zero length: {}", attr_len),
                ));
            }
            PathAttrValue::AtomicAggregate
        }
        AttrType::Aggregator => PathAttrValue::Aggregator(read_attr_aggregator(attr_data)?),
    };

    Ok((PathAttribute { flags, value }, header_len + attr_len))
}

fn read_path_attributes(bytes: &[u8]) -> Result<Vec<PathAttribute>, ParserError> {
    let mut cursor = 0;
    let mut path_attributes = Vec::new();

    while cursor < bytes.len() {
        let (attribute, consumed) = read_path_attribute(&bytes[cursor..])?;
        cursor += consumed;
        path_attributes.push(attribute);
    }

    Ok(path_attributes)
}

/// UPDATE message. The withdrawn-routes and path-attribute lengths are
/// authoritative; the NLRI list is whatever remains of the body.
#[derive(Debug, PartialEq)]
pub struct UpdateMessage {
    pub withdrawn_routes_len: u16,
    pub withdrawn_routes: Vec<Prefix>,
    pub total_path_attr_len: u16,
    pub path_attributes: Vec<PathAttribute>,
    pub nlri_list: Vec<Prefix>,
}

impl UpdateMessage {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ParserError> {
        let malformed = |what: &str| {
            ParserError::bgp(
                BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
                what.to_string(),
            )
        };

        if bytes.len() < 4 {
            return Err(malformed("UPDATE message body too short"));
        }

        let withdrawn_routes_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if 2 + withdrawn_routes_len + 2 > bytes.len() {
            return Err(malformed("withdrawn routes length exceeds message"));
        }
        let withdrawn_routes = parse_nlri_list(&bytes[2..2 + withdrawn_routes_len])?;

        let attrs_start = 4 + withdrawn_routes_len;
        let total_path_attr_len =
            u16::from_be_bytes([bytes[attrs_start - 2], bytes[attrs_start - 1]]) as usize;
        if attrs_start + total_path_attr_len > bytes.len() {
            return Err(malformed("path attribute length exceeds message"));
        }
        let path_attributes =
            read_path_attributes(&bytes[attrs_start..attrs_start + total_path_attr_len])?;

        let nlri_list = parse_nlri_list(&bytes[attrs_start + total_path_attr_len..])?;

        Ok(UpdateMessage {
            withdrawn_routes_len: withdrawn_routes_len as u16,
            withdrawn_routes,
            total_path_attr_len: total_path_attr_len as u16,
            path_attributes,
            nlri_list,
        })
    }
}
