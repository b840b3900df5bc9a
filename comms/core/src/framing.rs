// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Wire framing. Every message is
//! `magic (u32) ‖ type (u8) ‖ countdown (u8) ‖ reserved (u16) ‖ length (u32) ‖ checksum (u32)`
//! followed by `length` payload bytes. The header checksum is the additive rule
//! `magic + type + countdown + length`; payloads of four or more bytes end with a CRC32 over
//! the preceding payload bytes.

use bytes::{Buf, BytesMut};
use log::*;

const LOG_TARGET: &str = "comms::framing";

pub const HEADER_LENGTH: usize = 16;
pub const MAX_MESSAGE_LENGTH: usize = 100 * 1024 * 1024;

/// Bytes appended to a non-empty payload for its CRC.
const PAYLOAD_CRC_LENGTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub message_type: u8,
    pub countdown: u8,
    pub reserved: u16,
    pub length: u32,
    pub checksum: u32,
}

impl MessageHeader {
    pub fn for_payload(magic: u32, message_type: u8, countdown: u8, length: u32) -> Self {
        let checksum = magic
            .wrapping_add(u32::from(message_type))
            .wrapping_add(u32::from(countdown))
            .wrapping_add(length);
        Self {
            magic,
            message_type,
            countdown,
            reserved: 0,
            length,
            checksum,
        }
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum ==
            self.magic
                .wrapping_add(u32::from(self.message_type))
                .wrapping_add(u32::from(self.countdown))
                .wrapping_add(self.length)
    }

    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut bytes = [0u8; HEADER_LENGTH];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4] = self.message_type;
        bytes[5] = self.countdown;
        bytes[6..8].copy_from_slice(&self.reserved.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.length.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; HEADER_LENGTH]) -> Self {
        Self {
            magic: u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes")),
            message_type: bytes[4],
            countdown: bytes[5],
            reserved: u16::from_le_bytes(bytes[6..8].try_into().expect("2 bytes")),
            length: u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes")),
            checksum: u32::from_le_bytes(bytes[12..16].try_into().expect("4 bytes")),
        }
    }
}

/// A decoded message envelope: the type byte, the broadcast countdown and the raw body (without
/// its trailing CRC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u8,
    pub countdown: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: u8, countdown: u8, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            countdown,
            payload,
        }
    }

    /// Serialize into wire bytes under the given network magic: header, body and body CRC.
    pub fn to_wire(&self, magic: u32) -> Vec<u8> {
        let body_crc = (!self.payload.is_empty()) as usize * PAYLOAD_CRC_LENGTH;
        let length = (self.payload.len() + body_crc) as u32;
        let header = MessageHeader::for_payload(magic, self.message_type, self.countdown, length);

        let mut wire = Vec::with_capacity(HEADER_LENGTH + length as usize);
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(&self.payload);
        if !self.payload.is_empty() {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&self.payload);
            wire.extend_from_slice(&hasher.finalize().to_le_bytes());
        }
        wire
    }
}

enum FramerState {
    /// Scanning the byte stream for the magic prefix.
    Seeking,
    /// A validated header is in hand; waiting for the full payload.
    Payload(MessageHeader),
}

/// Incremental frame decoder. Bytes are fed in arbitrary chunks; complete valid frames come out.
/// Garbage before a magic prefix is discarded one byte at a time; frames with a bad header
/// checksum, an oversized length or a bad payload CRC are dropped without closing the stream.
pub struct Framer {
    magic: u32,
    buffer: BytesMut,
    state: FramerState,
}

impl Framer {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            buffer: BytesMut::new(),
            state: FramerState::Seeking,
        }
    }

    /// Feed raw bytes; returns every frame completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            match &self.state {
                FramerState::Seeking => {
                    if !self.seek_header() {
                        break;
                    }
                },
                FramerState::Payload(header) => {
                    let header = *header;
                    if self.buffer.len() < header.length as usize {
                        break;
                    }
                    let payload = self.buffer.split_to(header.length as usize);
                    self.state = FramerState::Seeking;
                    if let Some(frame) = check_payload(&header, &payload) {
                        frames.push(frame);
                    }
                },
            }
        }
        frames
    }

    /// Try to lock onto a valid header at the front of the buffer. Returns true when a header
    /// was consumed and the state advanced.
    fn seek_header(&mut self) -> bool {
        let magic_bytes = self.magic.to_le_bytes();
        while self.buffer.len() >= HEADER_LENGTH {
            if self.buffer[..4] != magic_bytes {
                // drop one byte and keep scanning for magic
                self.buffer.advance(1);
                continue;
            }
            let mut header_bytes = [0u8; HEADER_LENGTH];
            header_bytes.copy_from_slice(&self.buffer[..HEADER_LENGTH]);
            let header = MessageHeader::decode(&header_bytes);
            if !header.verify_checksum() {
                debug!(target: LOG_TARGET, "Dropping frame with bad header checksum");
                self.buffer.advance(1);
                continue;
            }
            if header.length as usize > MAX_MESSAGE_LENGTH {
                debug!(target: LOG_TARGET, "Dropping oversized frame of {} bytes", header.length);
                self.buffer.advance(HEADER_LENGTH);
                continue;
            }
            self.buffer.advance(HEADER_LENGTH);
            self.state = FramerState::Payload(header);
            return true;
        }
        false
    }
}

fn check_payload(header: &MessageHeader, payload: &[u8]) -> Option<Frame> {
    if payload.is_empty() {
        return Some(Frame::new(header.message_type, header.countdown, Vec::new()));
    }
    if payload.len() < PAYLOAD_CRC_LENGTH {
        debug!(target: LOG_TARGET, "Dropping undersized non-empty payload");
        return None;
    }
    let (body, crc_bytes) = payload.split_at(payload.len() - PAYLOAD_CRC_LENGTH);
    let expected = u32::from_le_bytes(crc_bytes.try_into().expect("4 bytes"));
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected {
        debug!(target: LOG_TARGET, "Dropping frame with bad payload CRC");
        return None;
    }
    Some(Frame::new(header.message_type, header.countdown, body.to_vec()))
}

#[cfg(test)]
mod test {
    use super::*;

    const MAGIC: u32 = 0x4550_4943;

    #[test]
    fn frame_survives_arbitrary_splits() {
        let frame = Frame::new(7, 255, b"some payload".to_vec());
        let wire = frame.to_wire(MAGIC);

        for split in 0..wire.len() {
            let mut framer = Framer::new(MAGIC);
            let mut got = framer.feed(&wire[..split]);
            got.extend(framer.feed(&wire[split..]));
            assert_eq!(got.len(), 1, "split at {}", split);
            assert_eq!(got[0], frame);
        }
    }

    #[test]
    fn prefix_alone_yields_nothing() {
        let wire = Frame::new(1, 0, b"data".to_vec()).to_wire(MAGIC);
        let mut framer = Framer::new(MAGIC);
        for end in 0..wire.len() {
            assert!(Framer::new(MAGIC).feed(&wire[..end]).is_empty());
        }
        assert_eq!(framer.feed(&wire).len(), 1);
    }

    #[test]
    fn garbage_before_magic_is_skipped() {
        let frame = Frame::new(2, 9, b"payload".to_vec());
        let mut wire = b"leading junk bytes".to_vec();
        wire.extend(frame.to_wire(MAGIC));
        let mut framer = Framer::new(MAGIC);
        let got = framer.feed(&wire);
        assert_eq!(got, vec![frame]);
    }

    #[test]
    fn corrupted_payload_crc_drops_frame_only() {
        let first = Frame::new(3, 0, b"first".to_vec());
        let second = Frame::new(4, 0, b"second".to_vec());
        let mut wire = first.to_wire(MAGIC);
        let len = wire.len();
        wire[len - 1] ^= 0xFF; // corrupt first frame's CRC
        wire.extend(second.to_wire(MAGIC));

        let mut framer = Framer::new(MAGIC);
        let got = framer.feed(&wire);
        assert_eq!(got, vec![second]);
    }

    #[test]
    fn bad_header_checksum_is_skipped() {
        let frame = Frame::new(5, 1, b"ok".to_vec());
        let mut wire = frame.to_wire(MAGIC);
        wire[12] ^= 0xFF; // corrupt header checksum
        wire.extend(frame.to_wire(MAGIC));
        let mut framer = Framer::new(MAGIC);
        let got = framer.feed(&wire);
        assert_eq!(got, vec![frame]);
    }

    #[test]
    fn empty_payload_frame() {
        let frame = Frame::new(6, 0, Vec::new());
        let wire = frame.to_wire(MAGIC);
        assert_eq!(wire.len(), HEADER_LENGTH);
        let mut framer = Framer::new(MAGIC);
        assert_eq!(framer.feed(&wire), vec![frame]);
    }

    #[test]
    fn two_frames_in_one_feed() {
        let a = Frame::new(1, 0, b"aa".to_vec());
        let b = Frame::new(2, 0, b"bb".to_vec());
        let mut wire = a.to_wire(MAGIC);
        wire.extend(b.to_wire(MAGIC));
        let mut framer = Framer::new(MAGIC);
        assert_eq!(framer.feed(&wire), vec![a, b]);
    }
}
