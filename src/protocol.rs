//! Protocol module
//!
//! This module defines the probe message exchanged between the discovery
//! client and the responder:
//! - Request type selection (which reply strategy the responder uses)
//! - Message envelope structure
//! - JSON serialization/deserialization bounded to one datagram
//!
//! The envelope carries no transaction id or sequence number. A discovery run
//! is strictly sequential per socket, so ordering is implicit.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

/// Largest datagram either side will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Probe request type
///
/// Serialized as its integer code (`0=Ping, 1=PublicCheck, 2=FullConeCheck,
/// 3=PortRestrictedCheck`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum ProbeRequestType {
    /// Plain echo from the receiving listener
    #[default]
    Ping = 0,
    /// Reply from the secondary listener to a host believed to be public
    PublicCheck = 1,
    /// Reply from the secondary listener through an existing NAT mapping
    FullConeCheck = 2,
    /// Echo from the receiving listener plus a reply from the tertiary listener
    PortRestrictedCheck = 3,
}

impl ProbeRequestType {
    /// All request types in wire-code order
    pub const ALL: [ProbeRequestType; 4] = [
        ProbeRequestType::Ping,
        ProbeRequestType::PublicCheck,
        ProbeRequestType::FullConeCheck,
        ProbeRequestType::PortRestrictedCheck,
    ];

    /// Integer code used on the wire
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ProbeRequestType {
    type Error = DecodeError;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Ping),
            1 => Ok(Self::PublicCheck),
            2 => Ok(Self::FullConeCheck),
            3 => Ok(Self::PortRestrictedCheck),
            other => Err(DecodeError::UnknownRequestType(other)),
        }
    }
}

impl From<ProbeRequestType> for u8 {
    fn from(request_type: ProbeRequestType) -> Self {
        request_type.code()
    }
}

/// Errors produced when decoding an inbound datagram
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Datagram exceeds [`MAX_DATAGRAM_SIZE`]
    #[error("Datagram too large: {0} bytes (max {})", MAX_DATAGRAM_SIZE)]
    TooLarge(usize),

    /// Request type code outside the known set
    #[error("Unknown request type: {0}")]
    UnknownRequestType(u8),

    /// Payload is not a valid probe message
    #[error("Malformed probe message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Probe envelope sent in both directions
///
/// Requests carry only `request_type`. Replies additionally carry the
/// textual form of the address the responder saw the request arrive from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeMessage {
    /// Reply strategy selector
    #[serde(rename = "ReqType", default)]
    pub request_type: ProbeRequestType,

    /// Address observed by the responder (replies only)
    #[serde(
        rename = "Addr",
        alias = "addr",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_address: Option<String>,
}

impl ProbeMessage {
    /// Create a request of the given type
    pub fn request(request_type: ProbeRequestType) -> Self {
        Self {
            request_type,
            observed_address: None,
        }
    }

    /// Create a reply reporting `observed` as the sender's address
    pub fn reply(request_type: ProbeRequestType, observed: SocketAddr) -> Self {
        Self {
            request_type,
            observed_address: Some(observed.to_string()),
        }
    }

    /// Encode the message to its JSON wire form
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message from a received datagram
    pub fn decode(data: &[u8]) -> std::result::Result<Self, DecodeError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(DecodeError::TooLarge(data.len()));
        }
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_omits_address() {
        let encoded = ProbeMessage::request(ProbeRequestType::FullConeCheck)
            .encode()
            .expect("Failed to encode");
        assert_eq!(encoded, br#"{"ReqType":2}"#.to_vec());
    }

    #[test]
    fn test_reply_wire_format() {
        let observed: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        let encoded = ProbeMessage::reply(ProbeRequestType::Ping, observed)
            .encode()
            .expect("Failed to encode");
        assert_eq!(
            String::from_utf8(encoded).unwrap(),
            r#"{"ReqType":0,"Addr":"203.0.113.9:40000"}"#
        );
    }

    #[test]
    fn test_request_type_codes() {
        for (code, request_type) in ProbeRequestType::ALL.iter().enumerate() {
            assert_eq!(request_type.code() as usize, code);
            assert_eq!(ProbeRequestType::try_from(code as u8).unwrap(), *request_type);
        }
        assert!(matches!(
            ProbeRequestType::try_from(4),
            Err(DecodeError::UnknownRequestType(4))
        ));
    }
}
