// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The typed wire message taxonomy over raw comms frames.

use std::sync::Arc;

use epic_comms::Frame;
use epic_common_types::Hash;

use crate::{
    blocks::Block,
    codec::{ByteReader, CodecError, Decodable, Encodable, WriteExt},
    transactions::Transaction,
};

/// Default broadcast time-to-live.
pub const DEFAULT_COUNTDOWN: u8 = 255;
/// Maximum number of blocks a single BUNDLE may carry.
pub const MAX_BUNDLE_BLOCKS: usize = 100_000;
/// Maximum milestone hashes per INV.
pub const MAX_INVENTORY_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    Pong = 1,
    Version = 2,
    VersionAck = 3,
    GetAddr = 4,
    Addr = 5,
    Tx = 6,
    Block = 7,
    Bundle = 8,
    GetInv = 9,
    Inv = 10,
    GetData = 11,
    NotFound = 12,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Ping),
            1 => Some(Self::Pong),
            2 => Some(Self::Version),
            3 => Some(Self::VersionAck),
            4 => Some(Self::GetAddr),
            5 => Some(Self::Addr),
            6 => Some(Self::Tx),
            7 => Some(Self::Block),
            8 => Some(Self::Bundle),
            9 => Some(Self::GetInv),
            10 => Some(Self::Inv),
            11 => Some(Self::GetData),
            12 => Some(Self::NotFound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub client_version: u32,
    pub local_service: u64,
    pub timestamp: u64,
    pub address_you: String,
    pub address_me: String,
    pub current_height: u64,
    pub id: u64,
}

/// Everything that travels between peers.
#[derive(Debug, Clone)]
pub enum NetMessage {
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Version(VersionMessage),
    VersionAck,
    GetAddr,
    Addr { addresses: Vec<String> },
    Tx(Arc<Transaction>),
    Block(Arc<Block>),
    /// A level-set transfer: a tracking nonce plus raw concatenated blocks (no count prefix;
    /// decoding runs until the payload is exhausted).
    Bundle { nonce: u32, blocks: Vec<Arc<Block>> },
    GetInv { locator: Vec<Hash>, nonce: u32 },
    Inv { hashes: Vec<Hash>, nonce: u32 },
    GetData { data_type: u8, hashes: Vec<Hash>, nonces: Vec<u32> },
    NotFound { hash: Hash, nonce: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Unknown message type {0}")]
    UnknownType(u8),
    #[error("Malformed payload: {0}")]
    Codec(#[from] CodecError),
    #[error("Message exceeds its size bound")]
    TooLarge,
}

impl NetMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            NetMessage::Ping { .. } => MessageType::Ping,
            NetMessage::Pong { .. } => MessageType::Pong,
            NetMessage::Version(_) => MessageType::Version,
            NetMessage::VersionAck => MessageType::VersionAck,
            NetMessage::GetAddr => MessageType::GetAddr,
            NetMessage::Addr { .. } => MessageType::Addr,
            NetMessage::Tx(_) => MessageType::Tx,
            NetMessage::Block(_) => MessageType::Block,
            NetMessage::Bundle { .. } => MessageType::Bundle,
            NetMessage::GetInv { .. } => MessageType::GetInv,
            NetMessage::Inv { .. } => MessageType::Inv,
            NetMessage::GetData { .. } => MessageType::GetData,
            NetMessage::NotFound { .. } => MessageType::NotFound,
        }
    }

    pub fn to_frame(&self, countdown: u8) -> Frame {
        Frame::new(self.message_type() as u8, countdown, self.encode_payload())
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            NetMessage::Ping { nonce } | NetMessage::Pong { nonce } => buf.put_u64(*nonce),
            NetMessage::Version(v) => {
                buf.put_u32(v.client_version);
                buf.put_u64(v.local_service);
                buf.put_u64(v.timestamp);
                buf.put_sized_bytes(v.address_you.as_bytes());
                buf.put_sized_bytes(v.address_me.as_bytes());
                buf.put_u64(v.current_height);
                buf.put_u64(v.id);
            },
            NetMessage::VersionAck | NetMessage::GetAddr => {},
            NetMessage::Addr { addresses } => {
                buf.put_compact_size(addresses.len() as u64);
                for address in addresses {
                    buf.put_sized_bytes(address.as_bytes());
                }
            },
            NetMessage::Tx(tx) => tx.encode_into(&mut buf),
            NetMessage::Block(block) => block.encode_into(&mut buf),
            NetMessage::Bundle { nonce, blocks } => {
                buf.put_u32(*nonce);
                for block in blocks {
                    block.encode_into(&mut buf);
                }
            },
            NetMessage::GetInv { locator, nonce } => {
                buf.put_u32(*nonce);
                buf.put_vec(locator);
            },
            NetMessage::Inv { hashes, nonce } => {
                buf.put_u32(*nonce);
                buf.put_vec(hashes);
            },
            NetMessage::GetData {
                data_type,
                hashes,
                nonces,
            } => {
                buf.put_u8(*data_type);
                buf.put_vec(hashes);
                buf.put_compact_size(nonces.len() as u64);
                for nonce in nonces {
                    buf.put_u32(*nonce);
                }
            },
            NetMessage::NotFound { hash, nonce } => {
                buf.put_hash(hash);
                buf.put_u32(*nonce);
            },
        }
        buf
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        let message_type =
            MessageType::from_byte(frame.message_type).ok_or(MessageError::UnknownType(frame.message_type))?;
        let mut reader = ByteReader::new(&frame.payload);
        let message = match message_type {
            MessageType::Ping => NetMessage::Ping {
                nonce: reader.read_u64()?,
            },
            MessageType::Pong => NetMessage::Pong {
                nonce: reader.read_u64()?,
            },
            MessageType::Version => NetMessage::Version(VersionMessage {
                client_version: reader.read_u32()?,
                local_service: reader.read_u64()?,
                timestamp: reader.read_u64()?,
                address_you: read_string(&mut reader)?,
                address_me: read_string(&mut reader)?,
                current_height: reader.read_u64()?,
                id: reader.read_u64()?,
            }),
            MessageType::VersionAck => NetMessage::VersionAck,
            MessageType::GetAddr => NetMessage::GetAddr,
            MessageType::Addr => {
                let count = reader.read_compact_size()? as usize;
                let mut addresses = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    addresses.push(read_string(&mut reader)?);
                }
                NetMessage::Addr { addresses }
            },
            MessageType::Tx => NetMessage::Tx(Arc::new(Transaction::decode(&mut reader)?)),
            MessageType::Block => NetMessage::Block(Arc::new(Block::decode(&mut reader)?)),
            MessageType::Bundle => {
                let nonce = reader.read_u32()?;
                let mut blocks = Vec::new();
                while !reader.is_empty() {
                    if blocks.len() >= MAX_BUNDLE_BLOCKS {
                        return Err(MessageError::TooLarge);
                    }
                    blocks.push(Arc::new(Block::decode(&mut reader)?));
                }
                NetMessage::Bundle { nonce, blocks }
            },
            MessageType::GetInv => {
                let nonce = reader.read_u32()?;
                let locator = reader.read_vec()?;
                NetMessage::GetInv { locator, nonce }
            },
            MessageType::Inv => {
                let nonce = reader.read_u32()?;
                let hashes: Vec<Hash> = reader.read_vec()?;
                if hashes.len() > MAX_INVENTORY_SIZE {
                    return Err(MessageError::TooLarge);
                }
                NetMessage::Inv { hashes, nonce }
            },
            MessageType::GetData => {
                let data_type = reader.read_u8()?;
                let hashes = reader.read_vec()?;
                let count = reader.read_compact_size()? as usize;
                let mut nonces = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    nonces.push(reader.read_u32()?);
                }
                NetMessage::GetData {
                    data_type,
                    hashes,
                    nonces,
                }
            },
            MessageType::NotFound => NetMessage::NotFound {
                hash: reader.read_hash()?,
                nonce: reader.read_u32()?,
            },
        };
        if !reader.is_empty() {
            return Err(MessageError::Codec(CodecError::InvalidField("trailing bytes")));
        }
        Ok(message)
    }
}

fn read_string(reader: &mut ByteReader<'_>) -> Result<String, CodecError> {
    let bytes = reader.read_sized_bytes()?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidField("utf-8 string"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{first_registration_block, new_address};

    fn round_trip(message: NetMessage) -> NetMessage {
        let frame = message.to_frame(DEFAULT_COUNTDOWN);
        assert_eq!(frame.countdown, DEFAULT_COUNTDOWN);
        NetMessage::from_frame(&frame).unwrap()
    }

    #[test]
    fn ping_pong_nonce_echo() {
        match round_trip(NetMessage::Ping { nonce: 99 }) {
            NetMessage::Ping { nonce } => assert_eq!(nonce, 99),
            other => panic!("wrong variant {:?}", other),
        }
        match round_trip(NetMessage::Pong { nonce: 99 }) {
            NetMessage::Pong { nonce } => assert_eq!(nonce, 99),
            other => panic!("wrong variant {:?}", other),
        }
    }

    #[test]
    fn version_round_trip() {
        let version = VersionMessage {
            client_version: 10,
            local_service: 1,
            timestamp: 1_650_000_000,
            address_you: "10.0.0.2:7877".into(),
            address_me: "10.0.0.1:7877".into(),
            current_height: 42,
            id: 7,
        };
        match round_trip(NetMessage::Version(version.clone())) {
            NetMessage::Version(v) => assert_eq!(v, version),
            other => panic!("wrong variant {:?}", other),
        }
    }

    #[test]
    fn block_and_bundle_round_trip() {
        let (_, addr) = new_address();
        let block = first_registration_block(&addr);
        match round_trip(NetMessage::Block(block.clone())) {
            NetMessage::Block(b) => assert_eq!(b.hash(), block.hash()),
            other => panic!("wrong variant {:?}", other),
        }

        let bundle = NetMessage::Bundle {
            nonce: 5,
            blocks: vec![block.clone(), block.clone()],
        };
        match round_trip(bundle) {
            NetMessage::Bundle { nonce, blocks } => {
                assert_eq!(nonce, 5);
                assert_eq!(blocks.len(), 2);
                assert_eq!(blocks[1].hash(), block.hash());
            },
            other => panic!("wrong variant {:?}", other),
        }
    }

    #[test]
    fn inventory_round_trip() {
        let hashes: Vec<Hash> = (0u8..4).map(|i| Hash::sha256(&[i])).collect();
        match round_trip(NetMessage::GetInv {
            locator: hashes.clone(),
            nonce: 1,
        }) {
            NetMessage::GetInv { locator, nonce } => {
                assert_eq!(locator, hashes);
                assert_eq!(nonce, 1);
            },
            other => panic!("wrong variant {:?}", other),
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let frame = NetMessage::Ping { nonce: 1 }.to_frame(1);
        let mut truncated = frame.clone();
        truncated.payload.truncate(3);
        assert!(NetMessage::from_frame(&truncated).is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let frame = Frame::new(200, 1, Vec::new());
        assert!(matches!(
            NetMessage::from_frame(&frame),
            Err(MessageError::UnknownType(200))
        ));
    }
}
